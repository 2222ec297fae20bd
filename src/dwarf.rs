//! DWARF-backed debug metadata provider
//!
//! Bundled [`DebugMetadataProvider`] for monitored code shipped as native
//! objects with DWARF debug info. Subprograms are enumerated once at load
//! time, grouped by their enclosing namespace/type, and exposed with their
//! `DW_AT_decl_line` as the routine first line. Binaries must be compiled
//! with debug info (`-g`) for overload disambiguation to work.

use anyhow::{Context, Result};
use gimli::Reader as _;
use object::{Object, ObjectSection};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::construct::{ConstructId, ConstructKind, Lang};
use crate::loader::{DebugMetadataProvider, ResolveError, RoutineInfo, TypeInfo};

/// Metadata provider over one object file with DWARF debug info.
pub struct DwarfMetadataProvider {
    resource: PathBuf,
    types: HashMap<String, TypeInfo>,
}

impl DwarfMetadataProvider {
    /// Load and index the DWARF debug info of the given binary.
    pub fn load(binary_path: &Path, lang: Lang) -> Result<Self> {
        if !binary_path.exists() {
            anyhow::bail!("binary does not exist: {}", binary_path.display());
        }

        let file = File::open(binary_path)
            .with_context(|| format!("failed to open binary: {}", binary_path.display()))?;
        let mmap = unsafe { memmap2::Mmap::map(&file) }.context("failed to memory-map binary")?;
        let object = object::File::parse(&*mmap).context("failed to parse object file")?;

        let endian = if object.is_little_endian() {
            gimli::RunTimeEndian::Little
        } else {
            gimli::RunTimeEndian::Big
        };

        let load_section =
            |id: gimli::SectionId| -> Result<gimli::EndianRcSlice<gimli::RunTimeEndian>> {
                let data = object
                    .section_by_name(id.name())
                    .and_then(|section| section.uncompressed_data().ok())
                    .unwrap_or(std::borrow::Cow::Borrowed(&[]));
                let bytes: std::rc::Rc<[u8]> = std::rc::Rc::from(data.into_owned());
                Ok(gimli::EndianRcSlice::new(bytes, endian))
            };

        let dwarf = gimli::Dwarf::load(&load_section)
            .context("failed to load DWARF sections - binary may lack debug symbols")?;

        let types = index_subprograms(&dwarf, lang)
            .context("failed to index DWARF subprograms")?;

        Ok(Self {
            resource: binary_path.to_path_buf(),
            types,
        })
    }

    pub fn type_count(&self) -> usize {
        self.types.len()
    }
}

impl DebugMetadataProvider for DwarfMetadataProvider {
    fn type_info(&self, type_name: &str) -> Result<TypeInfo, ResolveError> {
        self.types
            .get(type_name)
            .cloned()
            .ok_or_else(|| ResolveError::TypeNotFound(type_name.to_string()))
    }

    fn resource_of(&self, type_name: &str) -> Option<PathBuf> {
        self.types
            .get(type_name)
            .map(|_| self.resource.clone())
    }
}

type Reader = gimli::EndianRcSlice<gimli::RunTimeEndian>;

/// Walk every unit and collect named subprograms under their container path
/// (namespaces and types joined with dots).
fn index_subprograms(dwarf: &gimli::Dwarf<Reader>, lang: Lang) -> Result<HashMap<String, TypeInfo>> {
    let mut types: HashMap<String, TypeInfo> = HashMap::new();

    let mut units = dwarf.units();
    while let Some(header) = units.next()? {
        let unit = dwarf.unit(header)?;

        // Container names by entry depth; popped when the DFS leaves the
        // entry's subtree.
        let mut containers: Vec<(isize, String)> = Vec::new();
        let mut depth: isize = 0;

        let mut entries = unit.entries();
        while let Some((delta, entry)) = entries.next_dfs()? {
            depth += delta;
            while containers.last().is_some_and(|(d, _)| *d >= depth) {
                containers.pop();
            }

            match entry.tag() {
                gimli::DW_TAG_namespace
                | gimli::DW_TAG_structure_type
                | gimli::DW_TAG_class_type
                | gimli::DW_TAG_enumeration_type
                | gimli::DW_TAG_union_type => {
                    if let Some(name) = entry_name(dwarf, &unit, entry)? {
                        containers.push((depth, name));
                    }
                }
                gimli::DW_TAG_subprogram => {
                    let Some(name) = entry_name(dwarf, &unit, entry)? else {
                        continue;
                    };
                    if containers.is_empty() {
                        // Free function in the root scope, no owning type.
                        continue;
                    }
                    let container = containers
                        .iter()
                        .map(|(_, n)| n.as_str())
                        .collect::<Vec<_>>()
                        .join(".");
                    let first_line = entry
                        .attr_value(gimli::DW_AT_decl_line)?
                        .and_then(|v| v.udata_value())
                        .map(|l| l as u32);

                    let info = types.entry(container.clone()).or_insert_with(|| TypeInfo {
                        name: container.clone(),
                        routines: Vec::new(),
                    });
                    info.routines.push(RoutineInfo {
                        construct: ConstructId::new(
                            lang,
                            ConstructKind::Method,
                            format!("{container}.{name}()"),
                        ),
                        first_line,
                        // DWARF carries no test-framework markers.
                        test_entry: false,
                    });
                }
                _ => {}
            }
        }
    }

    Ok(types)
}

fn entry_name(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &gimli::Unit<Reader>,
    entry: &gimli::DebuggingInformationEntry<Reader>,
) -> Result<Option<String>> {
    let Some(value) = entry.attr_value(gimli::DW_AT_name)? else {
        return Ok(None);
    };
    let name = dwarf.attr_string(unit, value)?;
    Ok(Some(name.to_string_lossy()?.into_owned()))
}
