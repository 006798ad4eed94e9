use proc_macro::TokenStream;
use syn::DeriveInput;

mod attr;
mod decode;
mod encode;

/// Derive document encoding for a named struct.
///
/// Field attributes under `#[bson(..)]`:
/// - `rename = "key"` — wire key, default is the lower-cased field name;
///   `"-"` skips the field
/// - `skip` — never encoded nor decoded
/// - `omit_empty` — dropped when the value is empty for its type
/// - `min_size` — integer shrinks to int32 when the value fits
/// - `inline` — fields of the inner record expand into this document
#[proc_macro_derive(Encode, attributes(bson))]
pub fn encode(input: TokenStream) -> TokenStream {
    match encode::encode(syn::parse_macro_input!(input as DeriveInput)) {
        Ok(ok) => ok,
        Err(err) => err.into_compile_error().into(),
    }
}

/// Derive document decoding for a named struct.
///
/// Accepts the same `#[bson(..)]` attributes as [`Encode`], plus
/// `truncate` permitting lossy double to float reads. Missing keys fail
/// unless the field is an `Option` or marked `skip` (skipped fields take
/// their `Default`).
#[proc_macro_derive(Decode, attributes(bson))]
pub fn decode(input: TokenStream) -> TokenStream {
    match decode::decode(syn::parse_macro_input!(input as DeriveInput)) {
        Ok(ok) => ok,
        Err(err) => err.into_compile_error().into(),
    }
}
