#![warn(clippy::pedantic)]

extern crate proc_macro;

use proc_macro2::TokenStream;
use quote::{ToTokens, quote, quote_spanned};
use syn::{ItemFn, Stmt, parse::Parse, parse_macro_input, parse_quote};

/// Unit the exit event reports the elapsed time in.
#[derive(PartialEq, Eq, Clone, Copy, Default)]
enum Timing {
    #[default]
    Nanos,
    Micros,
    Millis,
    Seconds,
    Off,
}

impl Timing {
    /// Closure expression turning a `Duration` into the text appended to the exit event.
    fn formatter(self) -> syn::Expr {
        match self {
            Self::Nanos => {
                parse_quote!(|d: std::time::Duration| format!("{} ns elapsed", d.as_nanos()))
            }
            Self::Micros => {
                parse_quote!(|d: std::time::Duration| format!("{} us elapsed", d.as_micros()))
            }
            Self::Millis => {
                parse_quote!(|d: std::time::Duration| format!("{} ms elapsed", d.as_millis()))
            }
            Self::Seconds => {
                parse_quote!(|d: std::time::Duration| format!("{} s elapsed", d.as_secs()))
            }
            Self::Off => parse_quote!(|_: std::time::Duration| String::new()),
        }
    }
}

impl From<&str> for Timing {
    fn from(value: &str) -> Self {
        match value {
            "ns" | "nano" | "nanos" | "nanoseconds" => Self::Nanos,
            "us" | "micro" | "micros" | "microseconds" => Self::Micros,
            "ms" | "milli" | "millis" | "milliseconds" => Self::Millis,
            "s" | "sec" | "secs" | "seconds" => Self::Seconds,
            _ => Self::Off,
        }
    }
}

impl Parse for Timing {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        if !input.peek(syn::token::Paren) {
            return Ok(Self::default());
        }

        let content;
        let _ = syn::parenthesized!(content in input);
        let _ = content.parse::<keywords::precision>()?;
        let _ = content.parse::<syn::Token![=]>()?;
        let unit = content.parse::<syn::LitStr>()?.value();

        Ok(Self::from(unit.as_str()))
    }
}

mod keywords {
    syn::custom_keyword!(timing);
    syn::custom_keyword!(precision);
    syn::custom_keyword!(instrument);
}

#[derive(Default)]
struct Arguments {
    timing: Option<Timing>,
    instrument: Option<TokenStream>,
    unrecognised: Vec<syn::Error>,
}

impl Arguments {
    /// Unknown arguments are surfaced as deprecation warnings rather than hard errors.
    fn warnings(&self) -> impl ToTokens {
        let warnings = self.unrecognised.iter().map(|err| {
            let msg = syn::LitStr::new(&format!("found unrecognized input, {err}"), err.span());

            quote_spanned! {err.span()=>
                #[warn(deprecated)]
                {
                    #[deprecated(since = "not actually deprecated", note = #msg)]
                    const TRACED_ARGUMENT_WARNING: () = ();
                    let _ = TRACED_ARGUMENT_WARNING;
                }
            }
        });

        quote! {
            { #(#warnings)* }
        }
    }
}

impl Parse for Arguments {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        let mut arguments = Self::default();

        while !input.is_empty() {
            let lookahead = input.lookahead1();
            if lookahead.peek(keywords::timing) {
                if arguments.timing.is_some() {
                    return Err(input.error("expected only a single `timing` argument"));
                }

                let _ = input.parse::<keywords::timing>()?;
                arguments.timing = Some(input.parse()?);
            } else if lookahead.peek(keywords::instrument) {
                if arguments.instrument.is_some() {
                    return Err(input.error("expected only a single `instrument` argument"));
                }

                let _ = input.parse::<keywords::instrument>()?;
                if input.peek(syn::token::Paren) {
                    let content;
                    let _ = syn::parenthesized!(content in input);
                    arguments.instrument = Some(content.parse()?);
                } else {
                    arguments.instrument = Some(TokenStream::new());
                }
            } else if lookahead.peek(syn::Token![,]) {
                let _ = input.parse::<syn::Token![,]>()?;
            } else {
                arguments.unrecognised.push(lookahead.error());
                let _ = input.parse::<proc_macro2::TokenTree>();
            }
        }

        Ok(arguments)
    }
}

/// Emits `tracing::trace!` events when the attributed function is entered and left.
///
/// `instrument(...)` forwards its arguments to `#[tracing::instrument]`, and
/// `timing(precision = "ms")` appends the elapsed time to the exit event.
///
/// # Panics
///
/// When applied to anything other than a function.
#[proc_macro_attribute]
pub fn traced(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    let arguments = parse_macro_input!(args as Arguments);
    let warnings = arguments.warnings();

    let mut function = parse_macro_input!(item as ItemFn);

    function
        .attrs
        .push(parse_quote! { #[allow(clippy::items_after_statements)] });

    if let Some(fields) = arguments.instrument.as_ref() {
        let fields = fields.to_token_stream();
        function
            .attrs
            .push(parse_quote! { #[tracing::instrument(#fields)] });
    }

    let name = function.sig.ident.to_string();
    let on_exit: Stmt = match arguments.timing {
        Some(timing) => {
            let formatter = timing.formatter();
            parse_quote! {
                tracing::trace!("OnExit: {} ({})", #name, (#formatter)(self.started.elapsed()));
            }
        }
        None => parse_quote! { tracing::trace!("OnExit: {}", #name); },
    };

    let guard: Vec<Stmt> = parse_quote! {
        struct __TracedGuard {
            started: std::time::Instant,
        }

        impl __TracedGuard {
            fn enter() -> Self {
                #warnings

                tracing::trace!("OnEnter: {}", #name);
                Self {
                    started: std::time::Instant::now(),
                }
            }
        }

        impl std::ops::Drop for __TracedGuard {
            fn drop(&mut self) {
                #on_exit
            }
        }

        let __traced_guard = __TracedGuard::enter();
    };

    let body = std::mem::take(&mut function.block.stmts);
    function.block.stmts = guard.into_iter().chain(body).collect();

    proc_macro::TokenStream::from(quote! { #function })
}
