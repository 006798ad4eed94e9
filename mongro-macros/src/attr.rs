use syn::{Attribute, Field, LitStr};

/// Parsed `#[bson(..)]` field attributes.
#[derive(Default)]
pub struct FieldAttrs {
    pub rename: Option<String>,
    pub skip: bool,
    pub omit_empty: bool,
    pub min_size: bool,
    pub truncate: bool,
    pub inline: bool,
}

impl FieldAttrs {
    pub fn parse(attrs: &[Attribute]) -> syn::Result<FieldAttrs> {
        let mut out = FieldAttrs::default();
        for attr in attrs.iter().filter(|a| a.path().is_ident("bson")) {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("rename") {
                    let lit: LitStr = meta.value()?.parse()?;
                    if lit.value() == "-" {
                        out.skip = true;
                    } else {
                        out.rename = Some(lit.value());
                    }
                } else if meta.path.is_ident("skip") {
                    out.skip = true;
                } else if meta.path.is_ident("omit_empty") {
                    out.omit_empty = true;
                } else if meta.path.is_ident("min_size") {
                    out.min_size = true;
                } else if meta.path.is_ident("truncate") {
                    out.truncate = true;
                } else if meta.path.is_ident("inline") {
                    out.inline = true;
                } else {
                    return Err(meta.error("unknown bson attribute"));
                }
                Ok(())
            })?;
        }
        Ok(out)
    }

    /// Wire key for `field`: explicit rename, or the lower-cased name.
    pub fn key(&self, field: &Field) -> String {
        match &self.rename {
            Some(name) => name.clone(),
            None => field.ident.as_ref().unwrap().to_string().to_lowercase(),
        }
    }
}

/// Whether the field type is an `Option`, by its outermost path segment.
pub fn is_option(field: &Field) -> bool {
    match &field.ty {
        syn::Type::Path(path) => path
            .path
            .segments
            .last()
            .is_some_and(|segment| segment.ident == "Option"),
        _ => false,
    }
}
