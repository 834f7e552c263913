//! Annotated disassembly of cache code.
//!
//! [`Disassembler::listing`] prepares everything one listing needs and
//! returns [`Lines`], a lazy iterator that decodes, analyzes and renders one
//! instruction at a time. Preparation merges the image's own symbols (symtab,
//! ObjC metadata, stub and GOT targets) into the index, then loads the
//! image's function table, C string sections and code bytes.

use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::analysis::{AddressClassifier, Classification, FunctionTable, PairAnalyzer};
use crate::arm64::{self, DecodeError, Disassemble, Instruction};
use crate::cache::{ImageEntry, SharedCache};
use crate::demangle::demangle;
use crate::error::{Error, Result};
use crate::symbols::{IndexBuilder, SymbolIndex};

/// Longest string literal rendered in full, in bytes.
pub const STRING_PREVIEW_LIMIT: usize = 200;

/// Listing options.
#[derive(Debug, Clone)]
pub struct DisassOptions {
    /// Instructions to decode; zero decodes to the end of the function
    pub count: usize,
    /// Demangle names in labels and annotations
    pub demangle: bool,
    pub string_preview_limit: usize,
    /// Bytes per decode step; also sizes a counted listing
    pub instruction_width: usize,
}

impl Default for DisassOptions {
    fn default() -> Self {
        Self {
            count: 0,
            demangle: false,
            string_preview_limit: STRING_PREVIEW_LIMIT,
            instruction_width: arm64::INSTRUCTION_SIZE,
        }
    }
}

// =============================================================================
// Targets
// =============================================================================

/// What to disassemble: a symbol name or a virtual address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Symbol(String),
    Address(u64),
}

impl FromStr for Target {
    type Err = std::num::ParseIntError;

    /// `0x`-prefixed input is an address; anything else is a symbol name.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16).map(Target::Address),
            None => Ok(Target::Symbol(s.to_string())),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Symbol(name) => f.write_str(name),
            Target::Address(addr) => write!(f, "{addr:#x}"),
        }
    }
}

/// Resolves `target` to an address and the image whose `__TEXT` holds it.
///
/// A symbol with several addresses resolves to the lowest one inside an image
/// matching `image_filter`, or the lowest overall without a filter.
pub fn locate<'c, C: SharedCache + ?Sized>(
    cache: &'c C,
    index: &SymbolIndex,
    target: &Target,
    image_filter: Option<&str>,
) -> Result<(&'c ImageEntry, u64)> {
    if let Some(filter) = image_filter {
        if cache.find_image(filter).is_none() {
            return Err(Error::ImageNotFound {
                name: filter.to_string(),
            });
        }
    }

    let addr = match target {
        Target::Address(addr) => *addr,
        Target::Symbol(name) => index
            .addresses_of(name)
            .find(|&addr| match image_filter {
                Some(filter) => cache
                    .image_containing(addr)
                    .is_some_and(|image| image.matches_filter(filter)),
                None => true,
            })
            .ok_or_else(|| Error::SymbolNotFound { name: name.clone() })?,
    };

    let image = cache
        .image_containing(addr)
        .ok_or(Error::NoImageForAddress { addr })?;
    debug!("{} is at {:#x} in {}", target, addr, image.path);
    Ok((image, addr))
}

// =============================================================================
// Output Lines
// =============================================================================

/// One line of a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// Function entry label
    Label(String),
    Instruction {
        address: u64,
        bytes: [u8; 4],
        mnemonic: String,
        operands: String,
        annotation: Option<String>,
    },
    /// A word that failed to decode
    Diagnostic {
        address: u64,
        bytes: Vec<u8>,
        word: u32,
        message: String,
    },
}

fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

impl Line {
    fn instruction(instr: &Instruction, annotation: Option<String>) -> Self {
        Line::Instruction {
            address: instr.address,
            bytes: instr.bytes(),
            mnemonic: instr.mnemonic.clone(),
            operands: instr.operands_text().to_string(),
            annotation,
        }
    }

    fn diagnostic(err: &DecodeError) -> Self {
        Line::Diagnostic {
            address: err.address,
            bytes: err.bytes(),
            word: err.word,
            message: err.to_string(),
        }
    }

    pub fn is_label(&self) -> bool {
        matches!(self, Line::Label(_))
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Line::Label(name) => write!(f, "{name}:"),
            Line::Instruction {
                address,
                bytes,
                mnemonic,
                operands,
                annotation,
            } => {
                write!(
                    f,
                    "{:#08x}:  {}\t{:<10}{}",
                    address,
                    hex_bytes(bytes),
                    mnemonic,
                    operands
                )?;
                match annotation {
                    Some(text) => write!(f, " ; {text}"),
                    None => Ok(()),
                }
            }
            Line::Diagnostic {
                address,
                bytes,
                word,
                message,
            } => write!(
                f,
                "{:#08x}:  {}\t.long     {:#010x} ; {}",
                address,
                hex_bytes(bytes),
                word,
                message
            ),
        }
    }
}

// =============================================================================
// Rendering
// =============================================================================

/// Quotes `text`, cutting it after `limit` bytes with a trailing `...`.
pub fn render_string_literal(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return format!("{text:?}");
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{:?}...", &text[..cut])
}

/// Name for a function start, falling back to `func_<addr>`.
fn function_name(name: Option<&str>, start: u64, demangle_names: bool) -> String {
    match name {
        Some(name) if demangle_names => demangle(name),
        Some(name) => name.to_string(),
        None => format!("func_{start:x}"),
    }
}

/// Annotation text for a classification, or `None` when unresolved.
pub fn render_classification(
    classification: &Classification<'_>,
    options: &DisassOptions,
) -> Option<String> {
    match classification {
        Classification::Symbol(name) if options.demangle => Some(demangle(name)),
        Classification::Symbol(name) => Some(name.to_string()),
        Classification::StringLiteral(text) => {
            Some(render_string_literal(text, options.string_preview_limit))
        }
        Classification::Function {
            name,
            start,
            offset,
        } => {
            let name = function_name(*name, *start, options.demangle);
            Some(if *offset > 0 {
                format!("{name}+{offset:#x}")
            } else {
                name
            })
        }
        Classification::Unresolved => None,
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Produces annotated listings from a cache.
pub struct Disassembler<'c, C: SharedCache + ?Sized> {
    cache: &'c C,
    options: DisassOptions,
}

impl<'c, C: SharedCache + ?Sized> Disassembler<'c, C> {
    pub fn new(cache: &'c C, options: DisassOptions) -> Self {
        Self { cache, options }
    }

    /// Prepares a listing of `image` code starting at `start`.
    ///
    /// The per-image symbols of `image` are merged into `index` first; a
    /// failure there fails the listing. With a zero count the listing covers
    /// the rest of the function that contains `start`, which fails if no
    /// known function does.
    pub fn listing<'a>(
        &self,
        index: &'a mut SymbolIndex,
        image: &ImageEntry,
        start: u64,
    ) -> Result<Lines<'a>>
    where
        'c: 'a,
    {
        IndexBuilder::new(self.cache).enrich_image(index, image)?;
        let index: &'a SymbolIndex = index;

        let functions = FunctionTable::from(self.cache.function_starts(image)?);
        let strings = self.cache.cstring_regions(image)?;
        debug!(
            "{}: {} functions, {} string sections",
            image.path,
            functions.len(),
            strings.len()
        );

        let width = self.options.instruction_width;
        let len = match self.options.count {
            0 => {
                let (_, end) = functions
                    .enclosing(start)
                    .ok_or(Error::FunctionBoundsUnknown { addr: start })?;
                (end - start) as usize
            }
            count => count
                .checked_mul(width)
                .ok_or(Error::ListingTooLarge { count, width })?,
        };
        let code = self.cache.read_bytes(start, len)?;

        Ok(Lines {
            classifier: AddressClassifier::new(index, functions, strings),
            decoder: arm64::disassemble(code, start, width)?,
            analyzer: PairAnalyzer::new(),
            options: self.options.clone(),
            pending: None,
        })
    }
}

/// Lazy listing returned by [`Disassembler::listing`].
pub struct Lines<'a> {
    classifier: AddressClassifier<'a>,
    decoder: Disassemble<'a>,
    analyzer: PairAnalyzer,
    options: DisassOptions,
    /// Line held back while its label is emitted
    pending: Option<Line>,
}

impl Lines<'_> {
    fn annotate(&self, addr: u64) -> Option<String> {
        render_classification(&self.classifier.classify(addr), &self.options)
    }
}

impl Iterator for Lines<'_> {
    type Item = Line;

    fn next(&mut self) -> Option<Line> {
        if let Some(line) = self.pending.take() {
            return Some(line);
        }

        let item = self.decoder.next()?;
        let address = match &item {
            Ok(instr) => instr.address,
            Err(err) => err.address,
        };
        let label = self
            .classifier
            .function_label(address)
            .map(|name| function_name(name, address, self.options.demangle));

        let line = match item {
            Ok(instr) => {
                let annotation = self
                    .analyzer
                    .step(&instr)
                    .and_then(|addr| self.annotate(addr));
                Line::instruction(&instr, annotation)
            }
            Err(err) => {
                // An undecodable word breaks any adrp pair across it.
                self.analyzer.reset();
                Line::diagnostic(&err)
            }
        };

        match label {
            Some(label) => {
                self.pending = Some(line);
                Some(Line::Label(label))
            }
            None => Some(line),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::cache::{FunctionStarts, ObjcTable, StubTarget, Symbol};
    use crate::testutil::MockCache;

    /// Image A at 0x4000 exports `_foo`; image B at 0x8000 exports `_bar`.
    fn two_image_cache() -> MockCache {
        let mut cache = MockCache::new();
        let a = cache.add_image("/usr/lib/libA.dylib", 0x4000, 0x1000);
        let b = cache.add_image("/usr/lib/libB.dylib", 0x8000, 0x1000);

        cache.image_mut(a).exports = vec![Symbol::new(0x4000, "_foo")];
        cache.image_mut(a).starts = FunctionStarts {
            starts: vec![0x4000, 0x4010],
            code_end: 0x4020,
        };
        cache.image_mut(a).cstrings = vec![(0x4800, b"greeting\0".to_vec())];
        cache.image_mut(b).exports = vec![Symbol::new(0x8000, "_bar")];

        cache.write_words(
            0x4000,
            &[
                arm64::encode_adrp(0, 0x4000, 0x4800),
                arm64::encode_add_imm(0, 0, 0x800),
                arm64::encode_bl(0x4008, 0x8000),
                arm64::encode_nop(),
                arm64::encode_b(0x4010, 0x4000),
                0x0200_0000,
                arm64::encode_bl(0x4018, 0x4f00),
                0xD65F_03C0,
            ],
        );
        cache
    }

    fn listing_with(
        cache: &MockCache,
        index: &mut SymbolIndex,
        options: DisassOptions,
        start: u64,
    ) -> Vec<Line> {
        let image = cache.image_containing(start).unwrap().clone();
        Disassembler::new(cache, options)
            .listing(index, &image, start)
            .unwrap()
            .collect()
    }

    fn listing(cache: &MockCache, index: &mut SymbolIndex, count: usize, start: u64) -> Vec<Line> {
        let options = DisassOptions {
            count,
            ..Default::default()
        };
        listing_with(cache, index, options, start)
    }

    fn text(lines: &[Line]) -> Vec<String> {
        lines.iter().map(Line::to_string).collect()
    }

    #[test]
    fn test_label_precedes_first_instruction() {
        let cache = two_image_cache();
        let mut index = IndexBuilder::new(&cache).build().unwrap();

        let lines = listing(&cache, &mut index, 2, 0x4000);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], Line::Label("_foo".into()));
        assert_eq!(lines[0].to_string(), "_foo:");
        assert!(matches!(lines[1], Line::Instruction { address: 0x4000, .. }));
    }

    #[test]
    fn test_label_precedes_undecodable_first_word() {
        let mut cache = two_image_cache();
        cache.write_words(0x4000, &[0x0200_0000, arm64::encode_nop()]);
        let mut index = IndexBuilder::new(&cache).build().unwrap();

        let lines = listing(&cache, &mut index, 2, 0x4000);
        assert_eq!(
            text(&lines),
            vec![
                "_foo:",
                "0x004000:  00 00 00 02\t.long     0x02000000 ; invalid encoding (unallocated)",
                "0x004004:  1f 20 03 d5\tnop       ",
            ]
        );
    }

    #[test]
    fn test_simd_fp_function() {
        let mut cache = two_image_cache();
        // fmov d0, x1; scvtf d0, x0; ret
        cache.write_words(0x4000, &[0x9E67_0020, 0x9E62_0000, 0xD65F_03C0]);
        let mut index = IndexBuilder::new(&cache).build().unwrap();

        let lines = listing(&cache, &mut index, 3, 0x4000);
        assert_eq!(
            text(&lines),
            vec![
                "_foo:",
                "0x004000:  20 00 67 9e\tfmov      d0, x1",
                "0x004004:  00 00 62 9e\tscvtf     d0, x0",
                "0x004008:  c0 03 5f d6\tret       ",
            ]
        );
    }

    #[test]
    fn test_full_function_listing() {
        let mut cache = two_image_cache();
        cache.image_mut(0).stubs = vec![StubTarget {
            stub: 0x4f00,
            target: 0x8000,
        }];
        let mut index = IndexBuilder::new(&cache).build().unwrap();

        assert_eq!(
            text(&listing(&cache, &mut index, 0, 0x4000)),
            vec![
                "_foo:",
                "0x004000:  00 00 00 90\tadrp      x0, #0x4000",
                "0x004004:  00 00 20 91\tadd       x0, x0, #0x800 ; \"greeting\"",
                "0x004008:  fe 0f 00 94\tbl        #0x8000 ; _bar",
                "0x00400c:  1f 20 03 d5\tnop       ",
            ]
        );
    }

    #[test]
    fn test_diagnostics_and_unnamed_labels() {
        let mut cache = two_image_cache();
        cache.image_mut(0).stubs = vec![StubTarget {
            stub: 0x4f00,
            target: 0x8000,
        }];
        let mut index = IndexBuilder::new(&cache).build().unwrap();

        let lines = listing(&cache, &mut index, 4, 0x4010);
        assert_eq!(
            text(&lines),
            vec![
                "func_4010:",
                "0x004010:  fc ff ff 17\tb         #0x4000 ; _foo",
                "0x004014:  00 00 00 02\t.long     0x02000000 ; invalid encoding (unallocated)",
                "0x004018:  ba 03 00 94\tbl        #0x4f00 ; _bar",
                "0x00401c:  c0 03 5f d6\tret       ",
            ]
        );
    }

    #[test]
    fn test_pair_does_not_fold_across_decode_error() {
        let mut cache = two_image_cache();
        cache.write_words(
            0x4000,
            &[
                arm64::encode_adrp(0, 0x4000, 0x4800),
                0x0200_0000,
                arm64::encode_ldr_unsigned(1, 0, 0x8),
            ],
        );
        let mut index = SymbolIndex::new();
        let lines = listing(&cache, &mut index, 3, 0x4000);
        assert!(matches!(
            lines.last(),
            Some(Line::Instruction { annotation: None, .. })
        ));
    }

    #[test]
    fn test_got_load_is_named_after_target() {
        let mut cache = two_image_cache();
        cache.image_mut(0).got = vec![StubTarget {
            stub: 0x4a08,
            target: 0x8000,
        }];
        cache.write_words(
            0x4000,
            &[
                arm64::encode_adrp(16, 0x4000, 0x4a08),
                arm64::encode_ldr_unsigned(16, 16, 0xa08),
            ],
        );
        let mut index = IndexBuilder::new(&cache).build().unwrap();

        let lines = listing(&cache, &mut index, 2, 0x4000);
        assert_eq!(index.get(0x4a08), Some("_bar"));
        assert!(matches!(
            &lines[2],
            Line::Instruction { address: 0x4004, annotation: Some(text), .. } if text == "_bar"
        ));
    }

    #[test]
    fn test_instruction_width_sets_decode_step() {
        let cache = two_image_cache();
        let mut index = IndexBuilder::new(&cache).build().unwrap();
        let options = DisassOptions {
            count: 2,
            instruction_width: 8,
            ..Default::default()
        };

        let lines = listing_with(&cache, &mut index, options, 0x4000);
        let addresses: Vec<u64> = lines
            .iter()
            .filter_map(|line| match line {
                Line::Instruction { address, .. } => Some(*address),
                _ => None,
            })
            .collect();
        assert_eq!(addresses, vec![0x4000, 0x4008]);
    }

    #[test]
    fn test_oversized_count_is_rejected() {
        let cache = two_image_cache();
        let mut index = SymbolIndex::new();
        let image = cache.images()[0].clone();
        let options = DisassOptions {
            count: usize::MAX,
            ..Default::default()
        };
        assert!(matches!(
            Disassembler::new(&cache, options).listing(&mut index, &image, 0x4000),
            Err(Error::ListingTooLarge {
                count: usize::MAX,
                width: 4
            })
        ));
    }

    #[test]
    fn test_function_offsets_and_demangling() {
        let cache = two_image_cache();
        let mut index = IndexBuilder::new(&cache).build().unwrap();
        index.insert_if_absent(0x4010, "__ZN3foo3barEv");

        let options = DisassOptions {
            demangle: true,
            ..Default::default()
        };
        let rendered = render_classification(
            &Classification::Function {
                name: index.get(0x4010),
                start: 0x4010,
                offset: 8,
            },
            &options,
        );
        assert_eq!(rendered.as_deref(), Some("foo::bar()+0x8"));

        let image = cache.images()[0].clone();
        let lines: Vec<Line> = Disassembler::new(&cache, options)
            .listing(&mut index, &image, 0x4010)
            .unwrap()
            .take(1)
            .collect();
        assert_eq!(lines, vec![Line::Label("foo::bar()".into())]);
    }

    #[test]
    fn test_string_literal_truncation() {
        let exact = "a".repeat(200);
        assert_eq!(render_string_literal(&exact, 200), format!("\"{exact}\""));

        let long = "b".repeat(201);
        assert_eq!(
            render_string_literal(&long, 200),
            format!("\"{}\"...", "b".repeat(200))
        );

        // Never splits a multi-byte character.
        assert_eq!(render_string_literal("aé", 2), "\"a\"...");
    }

    #[test]
    fn test_listing_merges_objc_names() {
        let mut cache = two_image_cache();
        cache.image_mut(0).objc = Some(HashMap::from([(
            ObjcTable::Selectors,
            vec![Symbol::new(0x4800, "selRef_init")],
        )]));
        let mut index = IndexBuilder::new(&cache).build().unwrap();

        let lines = listing(&cache, &mut index, 2, 0x4000);
        assert_eq!(index.get(0x4800), Some("selRef_init"));
        assert!(matches!(
            &lines[2],
            Line::Instruction { annotation: Some(text), .. } if text == "selRef_init"
        ));
    }

    #[test]
    fn test_enrichment_failure_fails_listing() {
        let mut cache = two_image_cache();
        cache.image_mut(0).objc = Some(HashMap::new());
        cache.fail_objc = Some(ObjcTable::Methods);
        let mut index = SymbolIndex::new();
        let image = cache.images()[0].clone();

        let options = DisassOptions {
            count: 2,
            ..Default::default()
        };
        assert!(matches!(
            Disassembler::new(&cache, options).listing(&mut index, &image, 0x4000),
            Err(Error::ObjcParse { .. })
        ));
    }

    #[test]
    fn test_unbounded_start_needs_count() {
        let cache = two_image_cache();
        let mut index = SymbolIndex::new();
        let image = cache.images()[1].clone();
        assert!(matches!(
            Disassembler::new(&cache, DisassOptions::default()).listing(&mut index, &image, 0x8000),
            Err(Error::FunctionBoundsUnknown { addr: 0x8000 })
        ));
    }

    #[test]
    fn test_locate_targets() {
        let cache = two_image_cache();
        let index = IndexBuilder::new(&cache).build().unwrap();

        let (image, addr) = locate(&cache, &index, &"_bar".parse().unwrap(), None).unwrap();
        assert_eq!((image.index, addr), (1, 0x8000));

        let (image, addr) = locate(&cache, &index, &"0x4010".parse().unwrap(), None).unwrap();
        assert_eq!((image.index, addr), (0, 0x4010));

        assert!(matches!(
            locate(&cache, &index, &"_bar".parse().unwrap(), Some("libA")),
            Err(Error::SymbolNotFound { .. })
        ));
        assert!(matches!(
            locate(&cache, &index, &"_bar".parse().unwrap(), Some("libZ")),
            Err(Error::ImageNotFound { .. })
        ));
        assert!(matches!(
            locate(&cache, &index, &Target::Address(0x10), None),
            Err(Error::NoImageForAddress { addr: 0x10 })
        ));
    }
}
