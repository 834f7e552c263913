//! ObjC runtime metadata of cache images.
//!
//! Turns `__cfstring`, `__objc_selrefs` and `__objc_classlist` into symbols so
//! that references to constant strings, selectors, classes and method
//! implementations can be named in a listing.

use bitflags::bitflags;
use tracing::debug;

use super::context::DyldContext;
use crate::cache::{ImageEntry, ObjcTable, Symbol};
use crate::error::{Error, Result};
use crate::macho::MachOContext;

/// Size of a `__cfstring` constant string object.
const CFSTRING_SIZE: u64 = 32;
/// Offset of the character pointer inside a constant string object.
const CFSTRING_DATA_OFFSET: u64 = 16;

/// Offset of the `data` (class_rw/ro) pointer inside a class object.
const CLASS_DATA_OFFSET: u64 = 32;
/// Mask applied to the class `data` pointer to drop the Swift/RW flag bits.
const CLASS_DATA_MASK: u64 = 0x0000_7FFF_FFFF_FFF8;

/// Offsets inside `class_ro_t`.
const CLASS_RO_NAME_OFFSET: u64 = 24;
const CLASS_RO_METHODS_OFFSET: u64 = 32;

/// Offset of `relativeMethodSelectorBaseAddressOffset` in the ObjC optimization header.
const OBJC_OPTS_SELECTOR_BASE_OFFSET: u64 = 48;

bitflags! {
    /// Flag bits in the `entsizeAndFlags` word of a method list.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodListFlags: u32 {
        /// Entries are three 32-bit relative offsets
        const RELATIVE = 0x8000_0000;
        /// Relative name offsets point at selector strings, not selector refs
        const DIRECT_SELECTORS = 0x4000_0000;
    }
}

impl MethodListFlags {
    const ENTSIZE_MASK: u32 = 0x0000_FFFC;
}

/// A class and its metaclass, as found in `__objc_classlist`.
struct ClassEntry {
    addr: u64,
    name: String,
    ro: u64,
    meta_addr: u64,
    meta_ro: Option<u64>,
}

impl DyldContext {
    /// Extracts the symbols of one ObjC table of `image`.
    pub fn image_objc_symbols(&self, image: &ImageEntry, table: ObjcTable) -> Result<Vec<Symbol>> {
        let macho = self.macho(image)?;
        let symbols = match table {
            ObjcTable::CfStrings => self.cfstrings(&macho),
            ObjcTable::Selectors => self.selector_refs(&macho),
            ObjcTable::Classes => self.classes(&macho).map(|classes| {
                classes
                    .into_iter()
                    .flat_map(|class| {
                        [
                            Symbol::new(class.addr, format!("_OBJC_CLASS_$_{}", class.name)),
                            Symbol::new(
                                class.meta_addr,
                                format!("_OBJC_METACLASS_$_{}", class.name),
                            ),
                        ]
                    })
                    .filter(|sym| sym.address != 0)
                    .collect()
            }),
            ObjcTable::Methods => self.methods(&macho),
        }
        .map_err(|e| Error::objc(table.as_str(), &image.path, e))?;

        debug!("{}: {} objc {}", image.path, symbols.len(), table);
        Ok(symbols)
    }

    fn cfstrings(&self, macho: &MachOContext) -> Result<Vec<Symbol>> {
        let Some(section) = macho.objc_section("__cfstring") else {
            return Ok(Vec::new());
        };

        (0..section.size / CFSTRING_SIZE)
            .map(|i| {
                let addr = section.addr + i * CFSTRING_SIZE;
                let chars = self.read_pointer(addr + CFSTRING_DATA_OFFSET)?;
                let text = self.read_cstr(chars)?;
                Ok(Symbol::new(addr, format!("@{:?}", text)))
            })
            .collect()
    }

    fn selector_refs(&self, macho: &MachOContext) -> Result<Vec<Symbol>> {
        let Some(section) = macho.objc_section("__objc_selrefs") else {
            return Ok(Vec::new());
        };

        (0..section.size / 8)
            .map(|i| {
                let addr = section.addr + i * 8;
                let selector = self.read_cstr(self.read_pointer(addr)?)?;
                Ok(Symbol::new(addr, format!("selRef_{}", selector)))
            })
            .collect()
    }

    fn classes(&self, macho: &MachOContext) -> Result<Vec<ClassEntry>> {
        let Some(section) = macho.objc_section("__objc_classlist") else {
            return Ok(Vec::new());
        };

        (0..section.size / 8)
            .map(|i| {
                let addr = self.read_pointer(section.addr + i * 8)?;
                let ro = self.class_ro(addr)?;
                let name = self.read_cstr(self.read_pointer(ro + CLASS_RO_NAME_OFFSET)?)?;
                let meta_addr = self.read_pointer(addr)?;
                let meta_ro = if meta_addr != 0 {
                    Some(self.class_ro(meta_addr)?)
                } else {
                    None
                };
                Ok(ClassEntry {
                    addr,
                    name,
                    ro,
                    meta_addr,
                    meta_ro,
                })
            })
            .collect()
    }

    /// Follows a class object to its read-only data.
    fn class_ro(&self, class: u64) -> Result<u64> {
        if class == 0 {
            return Err(Error::InvalidObjcClass { addr: class });
        }
        let ro = self.read_pointer(class + CLASS_DATA_OFFSET)? & CLASS_DATA_MASK;
        if ro == 0 {
            return Err(Error::InvalidObjcClass { addr: class });
        }
        Ok(ro)
    }

    fn methods(&self, macho: &MachOContext) -> Result<Vec<Symbol>> {
        let mut symbols = Vec::new();
        for class in self.classes(macho)? {
            let lists = [(class.ro, '-')]
                .into_iter()
                .chain(class.meta_ro.map(|ro| (ro, '+')));
            for (ro, kind) in lists {
                let list = self.read_pointer(ro + CLASS_RO_METHODS_OFFSET)?;
                if list == 0 {
                    continue;
                }
                for (imp, selector) in self.method_list(list)? {
                    symbols.push(Symbol::new(
                        imp,
                        format!("{}[{} {}]", kind, class.name, selector),
                    ));
                }
            }
        }
        Ok(symbols)
    }

    /// Reads a method list, returning `(implementation, selector)` pairs.
    fn method_list(&self, list: u64) -> Result<Vec<(u64, String)>> {
        let raw_flags = self.read_u32(list)?;
        let count = self.read_u32(list + 4)? as u64;
        let flags = MethodListFlags::from_bits_truncate(raw_flags);
        let entsize = (raw_flags & MethodListFlags::ENTSIZE_MASK) as u64;

        let expected = if flags.contains(MethodListFlags::RELATIVE) {
            12
        } else {
            24
        };
        if entsize != expected {
            return Err(Error::InvalidObjcMethodList { addr: list });
        }

        let selector_base = if flags.contains(MethodListFlags::DIRECT_SELECTORS) {
            Some(self.relative_selector_base()?)
        } else {
            None
        };

        let mut methods = Vec::with_capacity(count as usize);
        for i in 0..count {
            let entry = list + 8 + i * entsize;
            let (imp, name) = if flags.contains(MethodListFlags::RELATIVE) {
                let name_off = self.read_i32(entry)? as i64;
                let imp_off = self.read_i32(entry + 8)? as i64;
                let name = match selector_base {
                    Some(base) => base.wrapping_add_signed(name_off),
                    None => self.read_pointer(entry.wrapping_add_signed(name_off))?,
                };
                (entry.wrapping_add(8).wrapping_add_signed(imp_off), name)
            } else {
                (
                    self.read_pointer(entry + 16)?,
                    self.read_pointer(entry)?,
                )
            };
            if imp != 0 {
                methods.push((imp, self.read_cstr(name)?));
            }
        }
        Ok(methods)
    }

    /// Base address for direct relative selector offsets.
    fn relative_selector_base(&self) -> Result<u64> {
        if !self.header.has_objc_opts() {
            return Err(Error::parse(0, "cache has no objc optimization header"));
        }
        let opts = self.base_address + self.header.objc_opts_offset;
        let offset = self.read_u64(opts + OBJC_OPTS_SELECTOR_BASE_OFFSET)?;
        Ok(self.base_address + offset)
    }
}
