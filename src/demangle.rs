//! Symbol name demangling for rendering.

use cpp_demangle::{DemangleOptions, Symbol as CppSymbol};
use rustc_demangle::try_demangle;

/// Demangles a Rust or Itanium C++ symbol name.
///
/// Mach-O symbols carry an extra leading underscore; it is stripped before
/// C++ demangling. Names in any other form (C, ObjC, Swift) come back
/// unchanged.
pub fn demangle(name: &str) -> String {
    if let Ok(rust) = try_demangle(name) {
        return format!("{rust:#}");
    }

    let itanium = name.strip_prefix('_').filter(|n| n.starts_with("_Z")).unwrap_or(name);
    if itanium.starts_with("_Z") {
        if let Some(cpp) = CppSymbol::new(itanium)
            .ok()
            .and_then(|sym| sym.demangle(&DemangleOptions::default()).ok())
        {
            return cpp;
        }
    }

    name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demangle_cpp() {
        assert_eq!(demangle("__ZN3foo3barEv"), "foo::bar()");
        assert_eq!(demangle("_ZN3foo3barEv"), "foo::bar()");
    }

    #[test]
    fn test_demangle_rust() {
        assert_eq!(
            demangle("_ZN4core3fmt5write17h0123456789abcdefE"),
            "core::fmt::write"
        );
    }

    #[test]
    fn test_plain_names_unchanged() {
        assert_eq!(demangle("_objc_msgSend"), "_objc_msgSend");
        assert_eq!(demangle("-[NSObject init]"), "-[NSObject init]");
        assert_eq!(demangle("_main"), "_main");
    }
}
