//! The wire protocol itself: the raw [`Message`] type, its parser and its
//! serializer.
//!
//! A katcp line is `<symbol><name>` followed by whitespace-separated escaped
//! arguments, where the symbol is `?` (request), `!` (reply) or `#` (inform).
//! [`Message`] holds arguments in *raw* (unescaped) form; escaping is applied
//! when serializing and removed when parsing, so any byte sequence can travel
//! through an argument.
//!
//! ## Examples
//!
//! ```
//! use std::str::FromStr;
//!
//! use katcp_device::protocol::Message;
//!
//! let msg = Message::from_str(r"?sensor-sampling cpu.power.on period 500").unwrap();
//! assert_eq!(msg.name(), "sensor-sampling");
//! assert_eq!(msg.arguments()[2], "500");
//! ```

use core::{fmt::Display, str::FromStr};

use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{alpha1, alphanumeric1, char, none_of, one_of},
    combinator::{eof, opt, recognize},
    multi::{fold_many1, many0, many1},
    sequence::{pair, preceded, tuple},
    IResult,
};
use thiserror::Error;

use crate::utils::escape;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
/// The kind of katcp message. The docs call this the type, but we want to scoot
/// around the fact that `type` is a reserved keyword.
pub enum MessageKind {
    /// Request (?) messages will always be acknowledged by a reply
    Request,
    /// Reply (!) messages are sent in response to a `Request`
    Reply,
    /// Inform (#) messages can be sent asynchronously and do not invoke a reply
    Inform,
}

impl MessageKind {
    pub(crate) fn symbol(self) -> char {
        match self {
            MessageKind::Request => '?',
            MessageKind::Reply => '!',
            MessageKind::Inform => '#',
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
/// The core raw message type of katcp
pub struct Message {
    /// The message kind
    pub(crate) kind: MessageKind,
    /// The message name
    pub(crate) name: String,
    /// The (potentially empty) vector of message arguments, held unescaped.
    /// It is left to consumers to define the serde into the appropriate types.
    pub(crate) arguments: Vec<String>,
}

#[derive(Error, Debug, PartialEq, Eq, Clone)]
/// The core error type for this crate
pub enum KatcpError {
    /// Malformed wire input or an invalid message name
    #[error("syntax error: {0}")]
    Syntax(String),
    /// An argument that could not be converted to the requested type
    #[error("bad argument: {0}")]
    BadArgument(String),
    /// A message ended before a required argument
    #[error("missing argument")]
    MissingArgument,
    /// A value rejected by a sensor's type or parameters
    #[error("invalid value: {0}")]
    InvalidValue(String),
    /// Anything else
    #[error("{0}")]
    Message(String),
}

pub type MessageResult = Result<Message, KatcpError>;

impl Message {
    /// A checked constructor. Fails with a syntax error if `name` is not a
    /// valid katcp name (alphabetic first character, then alphanumerics and
    /// dashes). Arguments are raw and may contain any characters.
    pub fn new<N, I>(kind: MessageKind, name: N, arguments: I) -> MessageResult
    where
        N: AsRef<str>,
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let name = name.as_ref();
        if !matches!(self::name(name), Ok(("", _))) {
            return Err(KatcpError::Syntax(format!("invalid message name {name:?}")));
        }
        Ok(Self::new_unvalidated(kind, name, arguments))
    }

    /// Constructor for crate-internal call sites whose names are literals or
    /// were already validated by the parser.
    pub(crate) fn new_unvalidated<N, I>(kind: MessageKind, name: N, arguments: I) -> Self
    where
        N: AsRef<str>,
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            kind,
            name: name.as_ref().to_owned(),
            arguments: arguments.into_iter().map(Into::into).collect(),
        }
    }

    /// Helper for creating request messages
    pub fn request<N, I>(name: N, arguments: I) -> MessageResult
    where
        N: AsRef<str>,
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self::new(MessageKind::Request, name, arguments)
    }

    /// Helper for creating reply messages
    pub fn reply<N, I>(name: N, arguments: I) -> MessageResult
    where
        N: AsRef<str>,
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self::new(MessageKind::Reply, name, arguments)
    }

    /// Helper for creating inform messages
    pub fn inform<N, I>(name: N, arguments: I) -> MessageResult
    where
        N: AsRef<str>,
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self::new(MessageKind::Inform, name, arguments)
    }

    /// Builds a reply to this message, reusing its (already validated) name.
    pub fn reply_to<I>(&self, arguments: I) -> Message
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self::new_unvalidated(MessageKind::Reply, &self.name, arguments)
    }

    /// Kind getter
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Name getter
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arguments getter (raw, unescaped)
    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }
}

fn kind(input: &str) -> IResult<&str, MessageKind> {
    let (remaining, typ) = one_of("!#?")(input)?;
    Ok((remaining, match typ {
        '?' => MessageKind::Request,
        '!' => MessageKind::Reply,
        '#' => MessageKind::Inform,
        _ => unreachable!(),
    }))
}

fn whitespace(input: &str) -> IResult<&str, &str> {
    recognize(many1(one_of(" \t")))(input)
}

fn name(input: &str) -> IResult<&str, &str> {
    recognize(pair(alpha1, many0(alt((alphanumeric1, tag("-"))))))(input)
}

fn escape_code(input: &str) -> IResult<&str, &str> {
    let (remaining, code) = preceded(char('\\'), one_of(r"\_0nret@"))(input)?;
    Ok((remaining, match code {
        '\\' => "\\",
        '_' => " ",
        '0' => "\0",
        'n' => "\n",
        'r' => "\r",
        'e' => "\u{1b}",
        't' => "\t",
        '@' => "",
        _ => unreachable!(),
    }))
}

fn plain(input: &str) -> IResult<&str, &str> {
    recognize(many1(none_of("\\ \0\n\r\t\u{1b}")))(input)
}

/// Parses a single escaped argument token into its raw form. `\@` decodes to
/// the empty string; unescaped special characters and unknown escapes fail.
fn argument(input: &str) -> IResult<&str, String> {
    fold_many1(
        alt((escape_code, plain)),
        String::new,
        |mut decoded, piece| {
            decoded.push_str(piece);
            decoded
        },
    )(input)
}

/// The parser combinator for a single terminator-free line. One could write a
/// grammar that utilizes this parser with nom.
pub fn message(input: &str) -> IResult<&str, Message> {
    let (remaining, (kind, name, arguments, _, _)) = tuple((
        kind,
        name,
        many0(preceded(whitespace, argument)),
        opt(whitespace),
        eof,
    ))(input)?;
    Ok((
        remaining,
        Message::new_unvalidated(kind, name, arguments),
    ))
}

impl FromStr for Message {
    type Err = KatcpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match message(s) {
            Ok((_, m)) => Ok(m),
            Err(_) => Err(KatcpError::Syntax(format!("invalid katcp message {s:?}"))),
        }
    }
}

impl TryFrom<&str> for Message {
    type Error = KatcpError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::from_str(s)
    }
}

// Serialization. The line terminator is appended by the transport, not here.
impl Display for Message {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}{}", self.kind.symbol(), self.name)?;
        for argument in &self.arguments {
            write!(f, " {}", escape(argument))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod parser_tests {
    use super::*;

    #[test]
    fn test_msg_type() {
        assert_eq!(Ok(("", MessageKind::Reply)), kind("!"));
        assert_eq!(Ok(("", MessageKind::Inform)), kind("#"));
        assert_eq!(Ok(("", MessageKind::Request)), kind("?"));
        assert!(kind("five").is_err());
    }

    #[test]
    fn test_name() {
        assert_eq!(Ok(("", "set-rate")), name("set-rate"));
        assert_eq!(Ok(("", "foobar")), name("foobar"));
        assert_eq!(Ok(("", "f00-bar")), name("f00-bar"));
        assert!(name("00-bar").is_err());
        assert!(name("-foo").is_err());
    }

    #[test]
    fn test_whitespace() {
        assert_eq!(Ok(("", " ")), whitespace(" "));
        assert_eq!(Ok(("", "    ")), whitespace("    "));
        assert_eq!(Ok(("", "\t    \t")), whitespace("\t    \t"));
    }

    #[test]
    fn test_argument_decoding() {
        assert_eq!(Ok(("", "6.1".to_owned())), argument("6.1"));
        assert_eq!(
            Ok(("", "Unknown request.".to_owned())),
            argument(r"Unknown\_request.")
        );
        assert_eq!(Ok(("", "".to_owned())), argument(r"\@"));
        assert_eq!(
            Ok(("", "a\\b\0c\nd\re\u{1b}f\tg".to_owned())),
            argument(r"a\\b\0c\nd\re\ef\tg")
        );
    }

    #[test]
    fn test_message() {
        assert_eq!(
            Message::request("set-rate", ["5.1"]).unwrap(),
            message("?set-rate 5.1").unwrap().1
        );
        assert_eq!(
            Message::reply("set-rate", ["ok"]).unwrap(),
            message("!set-rate ok").unwrap().1
        );
        assert_eq!(
            Message::reply("set-unknown-parameter", ["invalid", "Unknown request."]).unwrap(),
            message(r"!set-unknown-parameter invalid Unknown\_request.")
                .unwrap()
                .1
        );
        assert_eq!(
            Message::request("sensor-list", Vec::<String>::new()).unwrap(),
            message("?sensor-list").unwrap().1
        );
        assert_eq!(
            Message::inform(
                "sensor-list",
                ["drive.enable-azim", "Azimuth drive enable signal status", "", "boolean"]
            )
            .unwrap(),
            message(
                r"#sensor-list drive.enable-azim Azimuth\_drive\_enable\_signal\_status \@ boolean"
            )
            .unwrap()
            .1
        );
        // Trailing whitespace produces no empty argument
        assert_eq!(
            Message::inform("internet-box", ["address", "[2001:db8::1]:4000"]).unwrap(),
            message("#internet-box address [2001:db8::1]:4000 ").unwrap().1
        );
    }

    #[test]
    fn test_rejects() {
        assert!(Message::from_str("").is_err());
        assert!(Message::from_str("watchdog").is_err());
        assert!(Message::from_str("%watchdog").is_err());
        assert!(Message::from_str("?1nvalid").is_err());
        assert!(Message::from_str("?-foo").is_err());
        // Trailing backslash and unknown escape
        assert!(Message::from_str(r"?foo bar\").is_err());
        assert!(Message::from_str(r"?foo ba\qr").is_err());
        // Unescaped specials inside an argument
        assert!(Message::from_str("?foo b\u{1b}r").is_err());
        assert!(Message::from_str("?foo b\0r").is_err());
    }

    #[test]
    fn test_bad_names_unconstructible() {
        assert!(Message::request("1foo", Vec::<String>::new()).is_err());
        assert!(Message::request("", Vec::<String>::new()).is_err());
        assert!(Message::request("foo_bar", Vec::<String>::new()).is_err());
        assert!(Message::request("foo bar", Vec::<String>::new()).is_err());
    }
}

#[cfg(test)]
mod serialization_tests {
    use super::*;

    #[test]
    fn serialization() {
        let msg = Message::inform("foo-bar", ["foo", "bar"]).unwrap();
        assert_eq!("#foo-bar foo bar", msg.to_string());
    }

    #[test]
    fn serialization_escapes() {
        let msg = Message::inform("log", ["error", "something bad\nhappened"]).unwrap();
        assert_eq!(r"#log error something\_bad\nhappened", msg.to_string());
    }

    #[test]
    fn serialization_empty_argument() {
        let msg = Message::inform("sensor-list", ["cpu.power.on", ""]).unwrap();
        assert_eq!(r"#sensor-list cpu.power.on \@", msg.to_string());
    }
}

#[cfg(test)]
mod there_and_back_tests {
    use super::*;

    fn roundtrip(msg: Message) {
        assert_eq!(Message::from_str(&msg.to_string()).unwrap(), msg);
    }

    #[test]
    fn struct_and_back() {
        roundtrip(Message::inform("foo-bar", ["foo", "bar"]).unwrap());
        roundtrip(Message::request("watchdog", Vec::<String>::new()).unwrap());
        roundtrip(Message::reply("help", ["ok", "9"]).unwrap());
    }

    #[test]
    fn escape_table_and_back() {
        // One argument per entry of the escape alphabet
        for raw in ["\\", " ", "\0", "\n", "\r", "\u{1b}", "\t", ""] {
            roundtrip(Message::inform("echo", [raw]).unwrap());
        }
        // And all of them jammed together
        roundtrip(Message::inform("echo", ["a\\ \0\n\r\u{1b}\tz"]).unwrap());
    }

    #[test]
    fn string_and_back() {
        let msg_str = r"#foo-bar foo bar\_baz";
        assert_eq!(Message::from_str(msg_str).unwrap().to_string(), msg_str);
    }
}
