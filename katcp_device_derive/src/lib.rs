//! Derive macros for the `katcp-device` crate.
//!
//! The derives here generate boilerplate that is mechanical to write by hand:
//! wire-argument conversions for "discrete" (C-like) enums such as sensor
//! statuses and log levels. Deriving code assumes the items from
//! `katcp_device::prelude` are in scope.

use convert_case::{Case, Casing};
use proc_macro::TokenStream;
use proc_macro2::Ident;
use quote::quote;
use syn::{parse_macro_input, Data, DataEnum, DeriveInput, Fields};

fn unit_variants(data: Data) -> Vec<Ident> {
    let variants = match data {
        Data::Enum(DataEnum { variants, .. }) => variants,
        _ => panic!("KatcpDiscrete can only be derived on enums"),
    };
    variants
        .into_iter()
        .map(|variant| {
            if !matches!(variant.fields, Fields::Unit) {
                panic!("KatcpDiscrete variants must not carry fields");
            }
            variant.ident
        })
        .collect()
}

/// Derives `ToKatcpArgument` and `FromKatcpArgument` for a C-like enum.
///
/// The wire form of each variant is its name converted to kebab-case, i.e.
/// `Nominal` becomes `nominal` and `EventRate` would become `event-rate`.
/// Unknown strings fail with `KatcpError::BadArgument`.
#[proc_macro_derive(KatcpDiscrete)]
pub fn derive_katcp_discrete(tokens: TokenStream) -> TokenStream {
    let input = parse_macro_input!(tokens as DeriveInput);
    let enum_name = input.ident;
    let variants = unit_variants(input.data);
    let wire_names: Vec<String> = variants
        .iter()
        .map(|v| v.to_string().to_case(Case::Kebab))
        .collect();

    let generated = quote! {
        impl ToKatcpArgument for #enum_name {
            fn to_argument(&self) -> String {
                match self {
                    #(#enum_name::#variants => #wire_names.to_owned(),)*
                }
            }
        }

        impl FromKatcpArgument for #enum_name {
            type Err = KatcpError;

            fn from_argument(s: impl AsRef<str>) -> Result<Self, Self::Err> {
                match s.as_ref() {
                    #(#wire_names => Ok(#enum_name::#variants),)*
                    other => Err(KatcpError::BadArgument(other.to_owned())),
                }
            }
        }
    };
    TokenStream::from(generated)
}
