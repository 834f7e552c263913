//! Symbol index construction.
//!
//! The cache-wide index is assembled from three sources tried in a fixed
//! order. Each stage only fills addresses that are still unnamed:
//!
//! 1. [`Stage::Exported`]: every image's export table.
//! 2. [`Stage::Local`]: the cache's local symbols section.
//! 3. [`Stage::PatchExports`]: the patch table, only when the local stage
//!    failed.
//!
//! Failures of the first two stages are logged and the build moves on.
//! Unresolvable patch table offsets abort it.
//!
//! Per-image data (the image's own symtab, ObjC metadata, stub and GOT
//! targets) is merged separately by [`IndexBuilder::enrich_image`] for the image
//! being disassembled.

use std::fmt;

use tracing::{debug, info, warn};

use super::SymbolIndex;
use crate::cache::{ImageEntry, ObjcTable, SharedCache, StubTarget, Symbol};
use crate::error::{Error, Result};

/// A source of cache-wide symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Exported,
    Local,
    PatchExports,
}

impl Stage {
    /// Stages in priority order.
    pub const ORDER: [Stage; 3] = [Stage::Exported, Stage::Local, Stage::PatchExports];

    /// The stage whose failure this stage stands in for, if it is a fallback.
    pub fn fallback_for(self) -> Option<Stage> {
        match self {
            Stage::PatchExports => Some(Stage::Local),
            _ => None,
        }
    }

    /// Returns true if a failure of this stage aborts the build.
    pub fn is_fatal(self) -> bool {
        matches!(self, Stage::PatchExports)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Exported => "exported",
            Stage::Local => "local",
            Stage::PatchExports => "patch export",
        })
    }
}

/// Builds a [`SymbolIndex`] from a cache.
pub struct IndexBuilder<'a, C: SharedCache + ?Sized> {
    cache: &'a C,
}

impl<'a, C: SharedCache + ?Sized> IndexBuilder<'a, C> {
    pub fn new(cache: &'a C) -> Self {
        Self { cache }
    }

    /// Runs every applicable stage and merges the results in order.
    pub fn build(&self) -> Result<SymbolIndex> {
        let mut index = SymbolIndex::new();
        let mut failed = Vec::new();

        for stage in Stage::ORDER {
            if let Some(primary) = stage.fallback_for() {
                if !failed.contains(&primary) {
                    debug!("Skipping {} stage, {} stage succeeded", stage, primary);
                    continue;
                }
            }

            match self.run(stage) {
                Ok(symbols) => {
                    let total = symbols.len();
                    let added = index.merge(symbols);
                    info!("{} stage: {} of {} symbols added", stage, added, total);
                }
                Err(e) if stage.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("{} stage failed: {}", stage, e);
                    failed.push(stage);
                }
            }
        }

        info!("Symbol index holds {} entries", index.len());
        Ok(index)
    }

    fn run(&self, stage: Stage) -> Result<Vec<Symbol>> {
        match stage {
            Stage::Exported => self.cache.exported_symbols(),
            Stage::Local => self.cache.local_symbols(),
            Stage::PatchExports => self.patch_exports(),
        }
    }

    fn patch_exports(&self) -> Result<Vec<Symbol>> {
        let mut symbols = Vec::new();
        for image in self.cache.images() {
            let exports = match self.cache.patchable_exports(image) {
                Ok(exports) => exports,
                Err(e @ (Error::PatchInfoUnavailable | Error::UnsupportedPatchVersion(_))) => {
                    warn!("Patch table unusable: {}", e);
                    break;
                }
                Err(e) => return Err(e),
            };
            for export in exports {
                let addr = self.cache.offset_to_addr(export.impl_offset)?;
                symbols.push(Symbol::new(addr, export.name));
            }
        }
        Ok(symbols)
    }

    /// Merges the per-image sources of `image` into `index`.
    ///
    /// The image's own symtab is used only when the cache has no local
    /// symbols. ObjC metadata, stub and GOT targets are always merged; a
    /// failure in any of them is returned.
    pub fn enrich_image(&self, index: &mut SymbolIndex, image: &ImageEntry) -> Result<()> {
        if !self.cache.has_local_symbols() {
            match self.cache.image_symbols(image) {
                Ok(symbols) => {
                    let added = index.merge(symbols);
                    debug!("{}: {} symtab symbols added", image.path, added);
                }
                Err(e) if e.is_recoverable() => debug!("{}: no symtab: {}", image.path, e),
                Err(e) => return Err(e),
            }
        }

        if self.cache.has_objc(image)? {
            info!("Parsing ObjC metadata of {}", image.path);
            for table in ObjcTable::ALL {
                let added = index.merge(self.cache.objc_symbols(image, table)?);
                debug!("{}: {} objc {} added", image.path, added, table);
            }
        }

        let named = name_after_targets(index, self.cache.symbol_stubs(image)?);
        debug!("{}: {} stubs named", image.path, named);

        let named = name_after_targets(index, self.cache.got_entries(image)?);
        debug!("{}: {} GOT slots named", image.path, named);

        Ok(())
    }
}

/// Gives each stub or slot the name of the address it resolves to.
fn name_after_targets(index: &mut SymbolIndex, entries: Vec<StubTarget>) -> usize {
    let mut named = 0;
    for entry in entries {
        let Some(name) = index.get(entry.target).map(str::to_string) else {
            continue;
        };
        if index.insert_if_absent(entry.stub, name) {
            named += 1;
        }
    }
    named
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::cache::PatchableExport;
    use crate::testutil::MockCache;

    fn cache_with_exports() -> MockCache {
        let mut cache = MockCache::new();
        let a = cache.add_image("/usr/lib/libA.dylib", 0x4000, 0x1000);
        cache.image_mut(a).exports = vec![Symbol::new(0x4000, "_foo"), Symbol::new(0, "_zero")];
        cache
    }

    #[test]
    fn test_exports_then_locals() {
        let mut cache = cache_with_exports();
        cache.locals = Some(vec![
            Symbol::new(0x4000, "_foo_local"),
            Symbol::new(0x4100, "_bar"),
        ]);
        cache.image_mut(0).patch = vec![PatchableExport {
            name: "_patched".into(),
            impl_offset: 0x200,
        }];

        let index = IndexBuilder::new(&cache).build().unwrap();
        assert_eq!(index.get(0x4000), Some("_foo"));
        assert_eq!(index.get(0x4100), Some("_bar"));
        // Locals succeeded, so the patch table is never consulted.
        assert_eq!(index.get(0x200), None);
        assert_eq!(index.get(0), None);
    }

    #[test]
    fn test_patch_stage_after_local_failure() {
        let mut cache = cache_with_exports();
        cache.base_address = 0x4000;
        cache.image_mut(0).patch = vec![
            PatchableExport {
                name: "_foo_patch".into(),
                impl_offset: 0,
            },
            PatchableExport {
                name: "_baz".into(),
                impl_offset: 0x80,
            },
        ];

        let index = IndexBuilder::new(&cache).build().unwrap();
        assert_eq!(index.get(0x4000), Some("_foo"));
        assert_eq!(index.get(0x4080), Some("_baz"));
    }

    #[test]
    fn test_unresolvable_patch_offset_is_fatal() {
        let mut cache = cache_with_exports();
        cache.mapped_size = 0x100;
        cache.image_mut(0).patch = vec![PatchableExport {
            name: "_far".into(),
            impl_offset: 0x1000,
        }];

        assert!(matches!(
            IndexBuilder::new(&cache).build(),
            Err(Error::OffsetNotFound { offset: 0x1000 })
        ));
    }

    #[test]
    fn test_missing_patch_table_is_not_fatal() {
        let mut cache = cache_with_exports();
        cache.has_patch_table = false;

        let index = IndexBuilder::new(&cache).build().unwrap();
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_enrich_image() {
        let mut cache = cache_with_exports();
        cache.image_mut(0).symbols = vec![Symbol::new(0x4200, "_private"), Symbol::new(0, "_z")];
        cache.image_mut(0).objc = Some(HashMap::from([(
            ObjcTable::Methods,
            vec![Symbol::new(0x4300, "-[Foo bar]")],
        )]));
        cache.image_mut(0).stubs = vec![
            StubTarget {
                stub: 0x4f00,
                target: 0x4000,
            },
            StubTarget {
                stub: 0x4f0c,
                target: 0x9999,
            },
        ];

        cache.image_mut(0).got = vec![
            StubTarget {
                stub: 0x9000,
                target: 0x4300,
            },
            StubTarget {
                stub: 0x9008,
                target: 0x7777,
            },
        ];

        let builder = IndexBuilder::new(&cache);
        let mut index = builder.build().unwrap();
        let image = cache.images()[0].clone();
        builder.enrich_image(&mut index, &image).unwrap();

        assert_eq!(index.get(0x4200), Some("_private"));
        assert_eq!(index.get(0x4300), Some("-[Foo bar]"));
        assert_eq!(index.get(0x4f00), Some("_foo"));
        assert_eq!(index.get(0x4f0c), None);
        assert_eq!(index.get(0x9000), Some("-[Foo bar]"));
        assert_eq!(index.get(0x9008), None);
    }

    #[test]
    fn test_got_failure_is_fatal() {
        let mut cache = cache_with_exports();
        cache.fail_got = true;

        let builder = IndexBuilder::new(&cache);
        let mut index = builder.build().unwrap();
        let image = cache.images()[0].clone();
        assert!(matches!(
            builder.enrich_image(&mut index, &image),
            Err(Error::GotParse { .. })
        ));
    }

    #[test]
    fn test_local_stage_runs_after_export_failure() {
        let mut cache = cache_with_exports();
        cache.fail_exports = true;
        cache.locals = Some(vec![Symbol::new(0x4100, "_bar"), Symbol::new(0x4180, "_baz")]);
        cache.image_mut(0).patch = vec![PatchableExport {
            name: "_patched".into(),
            impl_offset: 0x200,
        }];

        let index = IndexBuilder::new(&cache).build().unwrap();
        assert_eq!(index.get(0x4100), Some("_bar"));
        assert_eq!(index.get(0x4180), Some("_baz"));
        // The patch table stands in for locals only.
        assert_eq!(index.get(0x4000), None);
        assert_eq!(index.get(0x200), None);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_objc_failure_is_fatal() {
        let mut cache = cache_with_exports();
        cache.image_mut(0).objc = Some(HashMap::new());
        cache.fail_objc = Some(ObjcTable::Selectors);

        let builder = IndexBuilder::new(&cache);
        let mut index = builder.build().unwrap();
        let image = cache.images()[0].clone();
        assert!(matches!(
            builder.enrich_image(&mut index, &image),
            Err(Error::ObjcParse { table: "selectors", .. })
        ));
    }
}
