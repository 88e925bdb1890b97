extern crate proc_macro;
extern crate syn;
#[macro_use]
extern crate quote;

use proc_macro::TokenStream;
use syn::parse_macro_input;

/// Derives a CSV row for a struct with named fields.
///
/// The generated code implements `Logging::header` (field names joined by
/// commas) and `Display` (field values in declaration order). Every field
/// must implement `Display`. The `Logging` trait has to be in scope at the
/// derive site.
#[proc_macro_derive(Logging)]
pub fn logging_derive(input: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(input as syn::DeriveInput);
    impl_logging(&ast).unwrap_or_else(|err| err.to_compile_error().into())
}

fn impl_logging(ast: &syn::DeriveInput) -> syn::Result<TokenStream> {
    let name = &ast.ident;
    let fields = match &ast.data {
        syn::Data::Struct(syn::DataStruct {
            fields: syn::Fields::Named(syn::FieldsNamed { ref named, .. }),
            ..
        }) => named,
        _ => {
            return Err(syn::Error::new_spanned(
                name,
                "Logging can only be derived for structs with named fields",
            ))
        }
    };
    let field_names: Vec<&syn::Ident> =
        fields.iter().filter_map(|field| field.ident.as_ref()).collect();

    let log_format = field_names
        .iter()
        .map(|_| "{}")
        .collect::<Vec<_>>()
        .join(",");
    let header_format = field_names
        .iter()
        .map(|field_name| field_name.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let (impl_generics, ty_generics, where_clause) =
        ast.generics.split_for_impl();

    let expanded = quote! {
        impl #impl_generics Logging for #name #ty_generics #where_clause {
            fn header(&self) -> String {
                concat!(#header_format, "\n").to_string()
            }
        }

        impl #impl_generics std::fmt::Display for #name #ty_generics #where_clause {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!(#log_format, "\n"), #(self.#field_names),*)
            }
        }
    };
    Ok(expanded.into())
}
