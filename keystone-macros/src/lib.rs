// These lints are triggered by darling's generated code for
// `#[darling(default)]`.
#![allow(clippy::option_if_let_else)]
#![allow(clippy::needless_continue)]

use darling::{FromDeriveInput, FromField, FromMeta, ast::Data, util::Ignored};
use heck::ToSnakeCase;
use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{DeriveInput, GenericArgument, Ident, PathArguments, Type, parse_macro_input};

/// Configuration for a field-level `#[entity(...)]` attribute.
#[derive(Debug, FromField)]
#[darling(attributes(entity))]
struct FieldArgs {
    ident: Option<Ident>,
    ty: Type,
    #[darling(default)]
    key: bool,
    #[darling(default)]
    version: bool,
    #[darling(default)]
    sql_type: Option<String>,
}

/// One `index(columns = "a, b", unique)` entry.
#[derive(Debug, FromMeta)]
struct IndexArgs {
    columns: String,
    #[darling(default)]
    unique: bool,
}

/// Configuration for the `#[entity(...)]` attribute on the struct.
#[derive(Debug, FromDeriveInput)]
#[darling(attributes(entity), supports(struct_named))]
struct EntityArgs {
    ident: Ident,
    generics: syn::Generics,
    data: Data<Ignored, FieldArgs>,
    #[darling(default)]
    schema: Option<String>,
    #[darling(default)]
    table: Option<String>,
    #[darling(multiple, rename = "index")]
    indexes: Vec<IndexArgs>,
}

/// A resolved column: name, SQL type and nullability.
struct Column {
    name: String,
    data_type: String,
    nullable: bool,
}

/// Returns the inner type if `ty` is `Option<T>`.
fn option_inner(ty: &Type) -> Option<&Type> {
    let Type::Path(path) = ty else {
        return None;
    };
    let segment = path.path.segments.last()?;
    if segment.ident != "Option" {
        return None;
    }
    let PathArguments::AngleBracketed(args) = &segment.arguments else {
        return None;
    };
    match args.args.first()? {
        GenericArgument::Type(inner) => Some(inner),
        _ => None,
    }
}

/// SQL type for a Rust type, by the last path segment. Anything unknown is
/// stored as `jsonb`.
fn sql_type_of(ty: &Type) -> &'static str {
    let ident = match ty {
        Type::Path(path) => path.path.segments.last().map(|s| s.ident.to_string()),
        Type::Reference(reference) => return sql_type_of(&reference.elem),
        _ => None,
    };
    match ident.as_deref() {
        Some("i16") => "smallint",
        Some("i32") => "integer",
        Some("i64") => "bigint",
        Some("f32") => "real",
        Some("f64") => "double precision",
        Some("bool") => "boolean",
        Some("String" | "str") => "text",
        Some("Uuid") => "uuid",
        _ => "jsonb",
    }
}

fn column_of(field: &FieldArgs, name: String) -> Column {
    let (inner, nullable) = option_inner(&field.ty).map_or((&field.ty, false), |inner| (inner, true));
    let data_type = field
        .sql_type
        .clone()
        .unwrap_or_else(|| sql_type_of(inner).to_owned());
    Column {
        name,
        data_type,
        nullable,
    }
}

/// Finds the single field carrying a marker, or reports why there is none.
fn marked<'a>(
    fields: &'a [&'a FieldArgs],
    is_marked: impl Fn(&FieldArgs) -> bool,
    marker: &str,
    struct_name: &Ident,
) -> darling::Result<&'a FieldArgs> {
    let mut found = fields.iter().copied().filter(|field| is_marked(*field));
    let first = found.next().ok_or_else(|| {
        darling::Error::custom(format!("exactly one field must be marked `#[entity({marker})]`"))
            .with_span(struct_name)
    })?;
    if let Some(second) = found.next() {
        let error = darling::Error::custom(format!("only one field may be marked `#[entity({marker})]`"));
        return Err(match &second.ident {
            Some(ident) => error.with_span(ident),
            None => error,
        });
    }
    Ok(first)
}

fn field_name(field: &FieldArgs) -> String {
    field
        .ident
        .as_ref()
        .map(|ident| ident.to_string().trim_start_matches("r#").to_owned())
        .unwrap_or_default()
}

/// Parse derive input with darling and render errors as tokens.
fn parse_or_error<T, F>(input: &DeriveInput, f: F) -> TokenStream2
where
    T: FromDeriveInput,
    F: FnOnce(T) -> darling::Result<TokenStream2>,
{
    match T::from_derive_input(input).and_then(f) {
        Ok(tokens) => tokens,
        Err(err) => err.write_errors(),
    }
}

/// Derives the `Entity` trait for a struct with named fields.
///
/// This macro generates:
/// - A static `EntityInfo` describing the table, its columns and indexes
/// - `Entity` trait implementation reading the key and version fields
///
/// Column names are the field names, which must match the struct's serde
/// representation. Column types are inferred from field types: `i16`, `i32`,
/// `i64`, `f32`, `f64`, `bool`, `String` and `Uuid` map to their `PostgreSQL`
/// counterparts, `Option<T>` makes a column nullable and anything else is
/// stored as `jsonb`.
///
/// # Attributes
///
/// ## Struct
/// - `schema = "name"` - Schema (default: `public`)
/// - `table = "name"` - Table (default: snake-case struct name)
/// - `index(columns = "a, b", unique)` - Secondary index; may be repeated
///
/// ## Field
/// - `key` - Primary key column (exactly one required)
/// - `version` - Concurrency version column, an `i64` (exactly one required)
/// - `sql_type = "type"` - Override the inferred column type
///
/// # Example
///
/// ```ignore
/// #[derive(Clone, Serialize, Deserialize, Entity)]
/// #[entity(schema = "blog", table = "blogs", index(columns = "title", unique))]
/// pub struct Blog {
///     #[entity(key)]
///     id: i64,
///     title: String,
///     #[entity(version)]
///     version: i64,
/// }
/// ```
#[proc_macro_derive(Entity, attributes(entity))]
pub fn derive_entity(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    derive_entity_impl(&input).into()
}

/// Internal entry point that returns tokens for the entity derive.
fn derive_entity_impl(input: &DeriveInput) -> TokenStream2 {
    parse_or_error::<EntityArgs, _>(input, generate_entity_impl)
}

/// Generate the entity derive implementation tokens.
fn generate_entity_impl(args: EntityArgs) -> darling::Result<TokenStream2> {
    let struct_name = &args.ident;
    if !args.generics.params.is_empty() {
        return Err(darling::Error::custom("entities cannot be generic").with_span(&args.generics));
    }
    let fields: Vec<&FieldArgs> = match &args.data {
        Data::Struct(fields) => fields.iter().collect(),
        Data::Enum(_) => return Err(darling::Error::unsupported_shape("enum")),
    };

    let key = marked(&fields, |f| f.key, "key", struct_name)?;
    let version = marked(&fields, |f| f.version, "version", struct_name)?;
    if std::ptr::eq(key, version) {
        return Err(
            darling::Error::custom("the key field cannot also be the version field")
                .with_span(struct_name),
        );
    }

    let columns: Vec<Column> = fields
        .iter()
        .map(|field| column_of(field, field_name(field)))
        .collect();

    let mut errors = darling::Error::accumulator();
    let mut indexes = Vec::new();
    for index in &args.indexes {
        let names: Vec<String> = index
            .columns
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_owned)
            .collect();
        if names.is_empty() {
            errors.push(darling::Error::custom("index(...) must name at least one column"));
            continue;
        }
        for name in &names {
            if !columns.iter().any(|column| &column.name == name) {
                errors.push(
                    darling::Error::custom(format!("index on unknown column `{name}`"))
                        .with_span(struct_name),
                );
            }
        }
        let unique = index.unique;
        indexes.push(quote! {
            ::keystone::IndexInfo {
                columns: &[#(#names),*],
                unique: #unique,
            }
        });
    }
    errors.finish()?;

    let name = struct_name.to_string();
    let schema = args.schema.clone().unwrap_or_else(|| "public".to_owned());
    let table = args
        .table
        .clone()
        .unwrap_or_else(|| name.to_snake_case());
    let key_column = field_name(key);
    let version_column = field_name(version);
    let key_ident = &key.ident;
    let key_ty = &key.ty;
    let version_ident = &version.ident;

    let column_infos = columns.iter().map(|column| {
        let Column {
            name,
            data_type,
            nullable,
        } = column;
        quote! {
            ::keystone::ColumnInfo {
                name: #name,
                data_type: #data_type,
                nullable: #nullable,
            }
        }
    });

    Ok(quote! {
        impl ::keystone::Entity for #struct_name {
            type Key = #key_ty;

            fn info() -> &'static ::keystone::EntityInfo {
                static INFO: ::keystone::EntityInfo = ::keystone::EntityInfo {
                    name: #name,
                    schema: #schema,
                    table: #table,
                    key: #key_column,
                    version: #version_column,
                    columns: &[#(#column_infos),*],
                    indexes: &[#(#indexes),*],
                };
                &INFO
            }

            fn key(&self) -> Self::Key {
                ::core::clone::Clone::clone(&self.#key_ident)
            }

            fn version(&self) -> i64 {
                self.#version_ident
            }

            fn set_version(&mut self, version: i64) {
                self.#version_ident = version;
            }
        }
    })
}
