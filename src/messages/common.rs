use chrono::{DateTime, TimeZone, Utc};
use katcp_device_derive::KatcpDiscrete;

use crate::protocol::KatcpError;

/// Timestamps are `chrono` instants in memory; on the wire they are integer
/// milliseconds since the Unix epoch.
pub type KatcpTimestamp = DateTime<Utc>;

/// The trait that is implemented for all the fundamental katcp types
/// as well as any user defined types such as (C-like) enums
pub trait ToKatcpArgument {
    /// Create a raw message argument (String) from a self
    fn to_argument(&self) -> String;
}

pub trait FromKatcpArgument
where
    Self: Sized,
{
    type Err; // Not Error as to not clash with Self being an enum with an `Error` variant
    /// Create a self from a raw message argument (String), potentially erroring
    fn from_argument(s: impl AsRef<str>) -> Result<Self, Self::Err>;
}

pub trait KatcpArgument: ToKatcpArgument + FromKatcpArgument {}

// Default KatcpArgument - "Trait Marker"
impl<T> KatcpArgument for T where T: ToKatcpArgument + FromKatcpArgument {}

// ---- Implementations for the "core" katcp types

// str and String are already raw
impl ToKatcpArgument for str {
    fn to_argument(&self) -> String {
        self.to_owned()
    }
}

impl ToKatcpArgument for String {
    fn to_argument(&self) -> String {
        self.clone()
    }
}

impl FromKatcpArgument for String {
    type Err = KatcpError;

    fn from_argument(s: impl AsRef<str>) -> Result<Self, Self::Err> {
        Ok(s.as_ref().to_owned())
    }
}

macro_rules! number_argument {
    ($($t:ty),*) => {
        $(
            impl ToKatcpArgument for $t {
                fn to_argument(&self) -> String {
                    self.to_string()
                }
            }

            impl FromKatcpArgument for $t {
                type Err = KatcpError;

                fn from_argument(s: impl AsRef<str>) -> Result<Self, Self::Err> {
                    s.as_ref()
                        .parse()
                        .map_err(|_| KatcpError::BadArgument(s.as_ref().to_owned()))
                }
            }
        )*
    };
}

number_argument!(i64, u32, u64, f64);

// bool
impl ToKatcpArgument for bool {
    fn to_argument(&self) -> String {
        (if *self { "1" } else { "0" }).to_owned()
    }
}

impl FromKatcpArgument for bool {
    type Err = KatcpError;

    fn from_argument(s: impl AsRef<str>) -> Result<Self, Self::Err> {
        match s.as_ref() {
            "1" => Ok(true),
            "0" => Ok(false),
            other => Err(KatcpError::BadArgument(other.to_owned())),
        }
    }
}

// DateTime<Utc>. Encoding truncates to whole milliseconds.
impl ToKatcpArgument for DateTime<Utc> {
    fn to_argument(&self) -> String {
        self.timestamp_millis().to_string()
    }
}

impl FromKatcpArgument for DateTime<Utc> {
    type Err = KatcpError;

    fn from_argument(s: impl AsRef<str>) -> Result<Self, Self::Err> {
        let millis: i64 = s
            .as_ref()
            .parse()
            .map_err(|_| KatcpError::BadArgument(s.as_ref().to_owned()))?;
        Utc.timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| KatcpError::BadArgument(s.as_ref().to_owned()))
    }
}

#[derive(KatcpDiscrete, Debug, PartialEq, Eq, Copy, Clone)]
/// Return codes that form the first parameter of a reply
pub enum RetCode {
    /// Request successfully processed. Further arguments are request-specific
    Ok,
    /// Request malformed. Second argument is a human-readable description of the error
    Invalid,
    /// Valid request that could not be processed. Second argument is a human-readable description of the error.
    Fail,
}

#[cfg(test)]
mod test_arguments {
    use super::*;

    #[test]
    fn test_string() {
        let s = "This is a message with spaces\n";
        assert_eq!(s, String::from_argument(s.to_argument()).unwrap());
    }

    #[test]
    fn test_numbers() {
        assert_eq!("-3", (-3i64).to_argument());
        assert_eq!(-3i64, i64::from_argument("-3").unwrap());
        assert!(i64::from_argument("1.5").is_err());
        assert_eq!(1.5f64, f64::from_argument("1.5").unwrap());
    }

    #[test]
    fn test_bool() {
        assert_eq!("1", true.to_argument());
        assert!(!bool::from_argument("0").unwrap());
        assert!(bool::from_argument("yes").is_err());
    }

    #[test]
    fn test_timestamp() {
        let ts = Utc.timestamp_opt(42069, 42_000_000).unwrap();
        assert_eq!("42069042", ts.to_argument());
        assert_eq!(ts, KatcpTimestamp::from_argument("42069042").unwrap());
        // Sub-millisecond precision is truncated by the encoding
        let fine = Utc.timestamp_opt(42069, 42_999_999).unwrap();
        assert_eq!("42069042", fine.to_argument());
    }

    #[test]
    fn test_ret_code() {
        let code = RetCode::Invalid;
        assert_eq!("invalid", code.to_argument());
        assert_eq!(code, RetCode::from_argument(code.to_argument()).unwrap());
        assert!(RetCode::from_argument("nope").is_err());
    }
}
