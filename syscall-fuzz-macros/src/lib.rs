use convert_case::{Case, Casing};
use itertools::Itertools;
use proc_macro::TokenStream;
use proc_macro_crate::{crate_name, FoundCrate};
use quote::{format_ident, quote};
use syn::{
  braced, bracketed, ext::IdentExt, parenthesized, parse::Parse, parse_macro_input,
  punctuated::Punctuated, token, Expr, Ident, Token,
};

/// Archs a syscall number may be given for. `x86` doubles as the compat
/// (int 0x80) table when the target is x86_64.
const KNOWN_ARCHS: &[&str] = &["x86_64", "aarch64", "riscv64", "x86"];
const COMPAT_HOST_ARCH: &str = "x86_64";
const COMPAT_ARCH: &str = "x86";
const MAX_ARGS: usize = 6;

struct ArgEntry {
  name: Ident,
  colon: Token![:],
  kind: Ident,
}

impl Parse for ArgEntry {
  fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
    Ok(Self {
      name: input.call(Ident::parse_any)?,
      colon: input.parse()?,
      kind: input.parse()?,
    })
  }
}

enum Attribute {
  Flags(Vec<Ident>),
  Sanitise(Expr),
  Post(Expr),
}

impl Parse for Attribute {
  fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
    let key: Ident = input.parse()?;
    let _colon: Token![:] = input.parse()?;
    match key.to_string().as_str() {
      "flags" => {
        let content;
        bracketed!(content in input);
        let flags = content.parse_terminated(Ident::parse, Token![,])?;
        Ok(Attribute::Flags(flags.into_iter().collect()))
      }
      "sanitise" => Ok(Attribute::Sanitise(input.parse()?)),
      "post" => Ok(Attribute::Post(input.parse()?)),
      other => Err(syn::Error::new(
        key.span(),
        format!("unknown syscall attribute `{other}`, expected flags, sanitise or post"),
      )),
    }
  }
}

struct AttributesExpr {
  plus: Token![+],
  brace_token: token::Brace,
  attrs: Punctuated<Attribute, Token![,]>,
}

impl Parse for AttributesExpr {
  fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
    let content;
    Ok(Self {
      plus: input.parse()?,
      brace_token: braced!(content in input),
      attrs: content.parse_terminated(Attribute::parse, Token![,])?,
    })
  }
}

struct SyscallEntry {
  name: syn::Ident,
  paren_token: token::Paren,
  args: Punctuated<ArgEntry, Token![,]>,
  attributes: Option<AttributesExpr>,
  for_token: Token![for],
  bracket_token: token::Bracket,
  archs: Punctuated<Arch, Token![,]>,
}

impl Parse for SyscallEntry {
  fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
    let args;
    let archs_content;
    Ok(SyscallEntry {
      name: input.parse()?,
      paren_token: parenthesized!(args in input),
      args: args.parse_terminated(ArgEntry::parse, Token![,])?,
      attributes: {
        let lookahead = input.lookahead1();
        if lookahead.peek(token::Plus) {
          Some(input.parse()?)
        } else {
          None
        }
      },
      for_token: input.parse()?,
      bracket_token: bracketed!(archs_content in input),
      archs: archs_content.parse_terminated(Arch::parse, Token![,])?,
    })
  }
}

struct Arch {
  name: syn::Ident,
  colon: Token![:],
  number: syn::LitInt,
}

impl Parse for Arch {
  fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
    let arch = Arch {
      name: input.parse()?,
      colon: input.parse()?,
      number: input.parse()?,
    };
    let name = arch.name.to_string();
    if !KNOWN_ARCHS.contains(&name.as_str()) {
      return Err(syn::Error::new(
        arch.name.span(),
        format!("unsupported arch `{name}`, expected one of {KNOWN_ARCHS:?}"),
      ));
    }
    Ok(arch)
  }
}

struct GenDescriptorResult {
  descriptor: proc_macro2::TokenStream,
  variant: Ident,
  name: String,
}

fn gen_descriptor(
  syscall: &SyscallEntry,
  crate_token: &proc_macro2::TokenStream,
) -> syn::Result<GenDescriptorResult> {
  let name = syscall.name.to_string();
  if syscall.args.len() > MAX_ARGS {
    return Err(syn::Error::new(
      syscall.name.span(),
      format!("`{name}` takes {} arguments, at most {MAX_ARGS} are supported", syscall.args.len()),
    ));
  }
  let variant = Ident::new(&name.to_case(Case::UpperCamel), syscall.name.span());

  let arg_specs = syscall.args.iter().map(|arg| {
    let arg_name = arg.name.unraw().to_string();
    let kind = &arg.kind;
    quote! {
      #crate_token::ArgSpec { name: #arg_name, kind: #crate_token::ArgKind::#kind }
    }
  });

  let mut flags = vec![];
  let mut sanitise = quote!(None);
  let mut post = quote!(None);
  if let Some(attributes) = &syscall.attributes {
    for attr in attributes.attrs.iter() {
      match attr {
        Attribute::Flags(f) => flags.extend(f.iter().cloned()),
        Attribute::Sanitise(expr) => sanitise = quote!(Some(#expr)),
        Attribute::Post(expr) => post = quote!(Some(#expr)),
      }
    }
  }
  let flags = if flags.is_empty() {
    quote!(::enumflags2::BitFlags::EMPTY)
  } else {
    quote! {{
      use #crate_token::SyscallFlag;
      ::enumflags2::make_bitflags!(SyscallFlag::{#(#flags)|*})
    }}
  };

  // Native numbers: whichever listed arch we are being compiled for.
  let (arch_names, numbers): (Vec<_>, Vec<_>) = syscall
    .archs
    .iter()
    .map(|x| (x.name.to_string(), x.number.clone()))
    .unzip();
  let native = quote! {
    #(
    if cfg!(target_arch = #arch_names) {
      Some(#numbers)
    } else
    )*
    {
      None
    }
  };
  let compat = match syscall.archs.iter().find(|x| x.name == COMPAT_ARCH) {
    Some(arch) => {
      let number = &arch.number;
      quote! {
        if cfg!(target_arch = #COMPAT_HOST_ARCH) {
          Some(#number)
        } else {
          None
        }
      }
    }
    None => quote!(None),
  };

  Ok(GenDescriptorResult {
    descriptor: quote! {
      #crate_token::SyscallDescriptor {
        id: SyscallName::#variant,
        args: &[#(#arg_specs),*],
        flags: #flags,
        sanitise: #sanitise,
        post: #post,
        numbers: #crate_token::SyscallNumbers {
          native: #native,
          compat: #compat,
        },
      }
    },
    variant,
    name,
  })
}

/// Expands a declarative syscall table into a `SyscallName` enum and a
/// `SYSCALLS` slice of descriptors.
///
/// ```ignore
/// syscall_table! {
///   read (fd: Fd, buf: Address, count: Len) for [x86_64: 0, aarch64: 63, x86: 3],
///   pause () + { flags: [NeedAlarm] } for [x86_64: 34, x86: 29],
/// }
/// ```
#[proc_macro]
pub fn syscall_table(input: TokenStream) -> TokenStream {
  let input =
    parse_macro_input!(input with Punctuated::<SyscallEntry, syn::Token![,]>::parse_terminated);
  let crate_token = get_crate("syscall-fuzz");

  if let Some(dup) = input.iter().map(|s| s.name.to_string()).duplicates().next() {
    let span = input
      .iter()
      .filter(|s| s.name == dup)
      .nth(1)
      .map(|s| s.name.span())
      .unwrap_or_else(proc_macro2::Span::call_site);
    return syn::Error::new(span, format!("syscall `{dup}` is declared twice"))
      .to_compile_error()
      .into();
  }

  let mut descriptors = vec![];
  let mut variants = vec![];
  let mut names = vec![];
  for syscall in &input {
    match gen_descriptor(syscall, &crate_token) {
      Ok(GenDescriptorResult {
        descriptor,
        variant,
        name,
      }) => {
        descriptors.push(descriptor);
        variants.push(variant);
        names.push(name);
      }
      Err(e) => return e.to_compile_error().into(),
    }
  }
  let count = descriptors.len();
  let const_names = names.iter().map(|n| format_ident!("SYS_{}", n));

  TokenStream::from(quote! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum SyscallName {
      #(#variants),*
    }

    impl SyscallName {
      pub const fn as_str(self) -> &'static str {
        match self {
          #(Self::#variants => #names),*
        }
      }
    }

    #(
      #[allow(non_upper_case_globals)]
      pub const #const_names: SyscallName = SyscallName::#variants;
    )*

    pub static SYSCALLS: [#crate_token::SyscallDescriptor; #count] = [
      #(#descriptors),*
    ];
  })
}

fn get_crate(name: &str) -> proc_macro2::TokenStream {
  let found_crate =
    crate_name(name).unwrap_or_else(|_| panic!("`{}` not found in `Cargo.toml`", name));

  match found_crate {
    FoundCrate::Itself => quote!(crate),
    FoundCrate::Name(name) => {
      let ident = format_ident!("{}", &name);
      quote!( #ident )
    }
  }
}
