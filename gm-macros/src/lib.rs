//! Derive macros for GM tool argument types.
//!
//! `#[derive(Tool)]` turns a struct with named fields into a model-callable
//! tool: it generates the JSON schema (as a `claude::ToolSchema` impl), the
//! tool name and description, and a parser from the model's JSON input.
//!
//! # Example
//!
//! ```ignore
//! /// Search the world's lore for facts relevant to the scene
//! #[derive(Tool, Deserialize)]
//! #[tool(name = "search_lore")]
//! struct SearchLore {
//!     /// What to look up
//!     query: String,
//!     /// Why the lookup is needed
//!     reasoning: Option<String>,
//! }
//! ```
//!
//! Fields whose type is not a primitive, `Option`, `Vec` or a set are
//! described by their own `ToolSchema` impl, so argument structs nest.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, DeriveInput, Field, GenericArgument, Lit, Meta, PathArguments, Type};

/// Derive macro for generating tool definitions.
///
/// # Attributes
///
/// - `#[tool(name = "...")]` - Override the tool name (defaults to snake_case struct name)
/// - `#[tool(optional)]` on fields - Leave the field out of `required`
/// - `#[tool(rename = "...")]` on fields - Override field name in schema
#[proc_macro_derive(Tool, attributes(tool))]
pub fn derive_tool(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand_tool(input)
        .unwrap_or_else(|err| err.to_compile_error())
        .into()
}

fn expand_tool(input: DeriveInput) -> syn::Result<TokenStream2> {
    let struct_name = &input.ident;
    let tool_name = get_tool_name(&input)?;
    let description = get_doc_comment(&input.attrs);

    let fields = match &input.data {
        syn::Data::Struct(data) => match &data.fields {
            syn::Fields::Named(named) => &named.named,
            _ => {
                return Err(syn::Error::new_spanned(
                    &input,
                    "Tool derive only supports structs with named fields",
                ))
            }
        },
        _ => return Err(syn::Error::new_spanned(&input, "Tool derive only supports structs")),
    };

    let mut property_tokens = Vec::new();
    let mut required_fields = Vec::new();

    for field in fields {
        let field_name = get_field_name(field)?;
        let field_desc = get_doc_comment(&field.attrs);
        let type_schema = type_to_schema(&field.ty);

        let desc_token = if field_desc.is_empty() {
            quote! {}
        } else {
            quote! { property["description"] = serde_json::json!(#field_desc); }
        };

        property_tokens.push(quote! {
            {
                let mut property = #type_schema;
                #desc_token
                properties.insert(#field_name.to_string(), property);
            }
        });

        if !is_field_optional(field) && !is_option_type(&field.ty) {
            required_fields.push(field_name);
        }
    }

    Ok(quote! {
        impl ::claude::ToolSchema for #struct_name {
            fn input_schema() -> serde_json::Value {
                let mut properties = serde_json::Map::new();
                #(#property_tokens)*

                let required: Vec<&str> = vec![#(#required_fields),*];

                serde_json::json!({
                    "type": "object",
                    "properties": properties,
                    "required": required
                })
            }
        }

        impl #struct_name {
            /// Get the tool name.
            pub fn tool_name() -> &'static str {
                #tool_name
            }

            /// Get the tool description.
            pub fn tool_description() -> &'static str {
                #description
            }

            /// Create a Tool definition for use with the Claude API.
            pub fn as_tool() -> ::claude::Tool {
                ::claude::Tool {
                    name: Self::tool_name().to_string(),
                    description: Self::tool_description().to_string(),
                    input_schema: <Self as ::claude::ToolSchema>::input_schema(),
                }
            }

            /// Parse the model-supplied tool input.
            pub fn from_input(input: &serde_json::Value) -> Result<Self, serde_json::Error> {
                serde_json::from_value(input.clone())
            }
        }
    })
}

fn get_tool_name(input: &DeriveInput) -> syn::Result<String> {
    for attr in &input.attrs {
        if attr.path().is_ident("tool") {
            if let Meta::NameValue(nv) = attr.parse_args::<Meta>()? {
                if nv.path.is_ident("name") {
                    if let Some(name) = lit_str(&nv.value) {
                        return Ok(name);
                    }
                    return Err(syn::Error::new_spanned(nv.value, "tool name must be a string"));
                }
            }
        }
    }

    Ok(to_snake_case(&input.ident.to_string()))
}

fn get_field_name(field: &Field) -> syn::Result<String> {
    for attr in &field.attrs {
        if attr.path().is_ident("tool") {
            if let Ok(Meta::NameValue(nv)) = attr.parse_args::<Meta>() {
                if nv.path.is_ident("rename") {
                    if let Some(name) = lit_str(&nv.value) {
                        return Ok(name);
                    }
                }
            }
        }
    }

    field
        .ident
        .as_ref()
        .map(|ident| ident.to_string())
        .ok_or_else(|| syn::Error::new_spanned(field, "expected a named field"))
}

fn is_field_optional(field: &Field) -> bool {
    field.attrs.iter().any(|attr| {
        attr.path().is_ident("tool")
            && matches!(attr.parse_args::<Meta>(), Ok(Meta::Path(path)) if path.is_ident("optional"))
    })
}

fn lit_str(expr: &syn::Expr) -> Option<String> {
    if let syn::Expr::Lit(expr_lit) = expr {
        if let Lit::Str(s) = &expr_lit.lit {
            return Some(s.value());
        }
    }
    None
}

fn get_doc_comment(attrs: &[syn::Attribute]) -> String {
    attrs
        .iter()
        .filter(|attr| attr.path().is_ident("doc"))
        .filter_map(|attr| match &attr.meta {
            Meta::NameValue(nv) => lit_str(&nv.value),
            _ => None,
        })
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn last_segment(ty: &Type) -> Option<&syn::PathSegment> {
    match ty {
        Type::Path(type_path) => type_path.path.segments.last(),
        _ => None,
    }
}

fn is_option_type(ty: &Type) -> bool {
    last_segment(ty).is_some_and(|segment| segment.ident == "Option")
}

fn first_type_argument(segment: &syn::PathSegment) -> Option<&Type> {
    if let PathArguments::AngleBracketed(args) = &segment.arguments {
        if let Some(GenericArgument::Type(inner)) = args.args.first() {
            return Some(inner);
        }
    }
    None
}

fn type_to_schema(ty: &Type) -> TokenStream2 {
    let Some(segment) = last_segment(ty) else {
        return quote! { serde_json::json!({}) };
    };

    match segment.ident.to_string().as_str() {
        "String" | "str" => quote! { serde_json::json!({"type": "string"}) },
        "i8" | "i16" | "i32" | "i64" | "isize" | "u8" | "u16" | "u32" | "u64" | "usize" => {
            quote! { serde_json::json!({"type": "integer"}) }
        }
        "f32" | "f64" => quote! { serde_json::json!({"type": "number"}) },
        "bool" => quote! { serde_json::json!({"type": "boolean"}) },
        "Value" => quote! { serde_json::json!({}) },
        "Option" => match first_type_argument(segment) {
            Some(inner) => type_to_schema(inner),
            None => quote! { serde_json::json!({}) },
        },
        "Vec" | "BTreeSet" | "HashSet" => {
            let unique = segment.ident != "Vec";
            let items = match first_type_argument(segment) {
                Some(inner) => type_to_schema(inner),
                None => quote! { serde_json::json!({}) },
            };
            if unique {
                quote! { serde_json::json!({"type": "array", "items": #items, "uniqueItems": true}) }
            } else {
                quote! { serde_json::json!({"type": "array", "items": #items}) }
            }
        }
        _ => quote! { <#ty as ::claude::ToolSchema>::input_schema() },
    }
}

fn to_snake_case(s: &str) -> String {
    let mut result = String::new();
    for (i, c) in s.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                result.push('_');
            }
            result.push(c.to_ascii_lowercase());
        } else {
            result.push(c);
        }
    }
    result
}
