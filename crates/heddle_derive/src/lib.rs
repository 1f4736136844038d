use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

mod args;

/// Derives `KernelArgs` for a struct. Fields become kernel arguments in declaration order.
///
/// Fields are scalars by default; mark them with `#[arg(buffer)]`, `#[arg(local)]`,
/// `#[arg(image)]`, `#[arg(sampler)]` or `#[arg(skip)]` otherwise.
#[proc_macro_derive(KernelArgs, attributes(kernel_args, arg))]
pub fn derive_kernel_args(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let expanded = args::derive_kernel_args(input);
    expanded.into()
}
