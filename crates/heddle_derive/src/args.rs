use proc_macro2::TokenStream;
use quote::quote;
use syn::{
    DeriveInput, Fields, Index, LitStr, Path, Token, WherePredicate, punctuated::Punctuated,
    spanned::Spanned,
};

/// How a struct field is lowered into a kernel argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgKind {
    Scalar,
    Buffer,
    Local,
    Image,
    Sampler,
    Skip,
}

fn parse_arg_kind(field: &syn::Field) -> syn::Result<ArgKind> {
    let mut kind = ArgKind::Scalar;
    for attr in field.attrs.iter().filter(|a| a.path().is_ident("arg")) {
        attr.parse_nested_meta(|meta| {
            kind = match meta.path.get_ident().map(|x| x.to_string()).as_deref() {
                Some("scalar") => ArgKind::Scalar,
                Some("buffer") => ArgKind::Buffer,
                Some("local") => ArgKind::Local,
                Some("image") => ArgKind::Image,
                Some("sampler") => ArgKind::Sampler,
                Some("skip") => ArgKind::Skip,
                _ => {
                    return Err(meta.error(
                        "unexpected argument kind; supported are `scalar`, `buffer`, `local`, `image`, `sampler` and `skip`",
                    ));
                }
            };
            Ok(())
        })?;
    }
    Ok(kind)
}

pub fn derive_kernel_args(input: DeriveInput) -> TokenStream {
    // retrieve struct field information
    let fields = match &input.data {
        syn::Data::Struct(data_struct) => &data_struct.fields,
        _ => {
            return syn::Error::new(input.span(), "`KernelArgs` can only be derived for structs")
                .to_compile_error();
        }
    };

    // field access expressions in declaration order, which is the kernel's argument order
    let accesses: Vec<_> = match fields {
        Fields::Named(fields_named) => fields_named
            .named
            .iter()
            .map(|f| {
                let ident = &f.ident;
                (f, quote! { self.#ident })
            })
            .collect(),
        Fields::Unnamed(fields_unnamed) => fields_unnamed
            .unnamed
            .iter()
            .enumerate()
            .map(|(i, f)| {
                let index = Index::from(i);
                (f, quote! { self.#index })
            })
            .collect(),
        Fields::Unit => {
            return syn::Error::new(
                input.span(),
                "unit structs are not supported by `KernelArgs` derive",
            )
            .to_compile_error();
        }
    };

    let name = input.ident;

    // parse kernel_args attributes
    let mut crate_name = None;
    let mut user_bounds = Punctuated::<WherePredicate, Token![,]>::new();
    for attr in &input.attrs {
        if !attr.path().is_ident("kernel_args") {
            continue;
        }

        let result = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("crate") {
                let value = meta.value()?;
                let s: LitStr = value.parse()?;
                crate_name = Some(s.parse::<Path>()?);
                Ok(())
            } else if meta.path.is_ident("bound") {
                let value = meta.value()?;
                let s: LitStr = value.parse()?;
                let predicates =
                    s.parse_with(Punctuated::<WherePredicate, Token![,]>::parse_terminated)?;
                user_bounds.extend(predicates);
                Ok(())
            } else {
                Err(meta.error("unexpected attribute; supported are `crate` and `bound`"))
            }
        });

        if let Err(err) = result {
            return err.to_compile_error();
        }
    }
    // determine the base path for trait implementation
    let base_path = match crate_name {
        Some(path) => quote!(#path::loom::kernel),
        None => quote!(::heddle::loom::kernel),
    };

    let mut pushes = Vec::with_capacity(accesses.len());
    for (field, access) in accesses {
        let kind = match parse_arg_kind(field) {
            Ok(kind) => kind,
            Err(err) => return err.to_compile_error(),
        };
        let expr = match kind {
            ArgKind::Scalar => quote! { #base_path::KernelArg::scalar(&#access) },
            ArgKind::Buffer => quote! { #base_path::KernelArg::buffer(#access.clone()) },
            ArgKind::Local => quote! { #base_path::KernelArg::Local(#access) },
            ArgKind::Image => quote! { #base_path::KernelArg::Image(#access.clone()) },
            ArgKind::Sampler => quote! { #base_path::KernelArg::Sampler(#access) },
            ArgKind::Skip => continue,
        };
        pushes.push(quote! { args.push(#expr); });
    }
    let count = pushes.len();

    // handle struct generics
    let generics = &input.generics;
    let (impl_generics, ty_generics, _) = generics.split_for_impl();

    // prepare where clause
    let mut generics = generics.clone();
    let where_clause = generics.make_where_clause();
    where_clause.predicates.extend(user_bounds);

    quote! {
        impl #impl_generics #base_path::KernelArgs for #name #ty_generics #where_clause {
            fn args(&self) -> Vec<#base_path::KernelArg> {
                #[allow(unused_mut)]
                let mut args = Vec::with_capacity(#count);
                #(#pushes)*
                args
            }
        }
    }
}
