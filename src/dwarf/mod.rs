//! The debug database: ELF sections, the DWARF tree, frame information and
//! the queries the tracer asks while building events.

pub mod eval;
pub mod frame;
pub mod loclist;
pub mod unit;
pub mod unwind;

use crate::dwarf::eval::ExpressionEvaluator;
use crate::dwarf::frame::{dwarf_endian, FrameContext, FrameTable};
use crate::dwarf::loclist::LocList;
use crate::dwarf::unit::{FunctionEntry, LocationAttr, Unit, UnitParser, VariableEntry};
use crate::error::{Error, Result};
use crate::process::{SharedLibrary, Thread};
use crate::register::DwarfRegisters;
use gimli::{DebugLoc, DebugLocLists, RunTimeEndian};
use log::{debug, warn};
use memmap2::Mmap;
use object::{Object, ObjectSection, ObjectSymbol};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub type EndianArcSlice = gimli::EndianArcSlice<RunTimeEndian>;

struct SymbolEntry {
    name: String,
    address: u64,
    size: u64,
}

/// Debug information of one ELF image (the executable or a shared library),
/// plus the images folded in for shared libraries with their own DWARF.
pub struct DebugData {
    path: PathBuf,
    endian: RunTimeEndian,
    entry_point: usize,
    static_base: usize,
    loclist: LocList,
    frame_table: Option<FrameTable>,
    units: Vec<Unit>,
    functions: Vec<FunctionEntry>,
    /// Synthetic entries from symbol tables of libraries without DWARF.
    lib_functions: Vec<FunctionEntry>,
    libs: Vec<DebugData>,
    symbols: Vec<SymbolEntry>,
    /// pc -> function memoization; only taken for the duration of a lookup,
    /// never across a wait.
    function_cache: Mutex<HashMap<usize, FunctionEntry>>,
}

impl DebugData {
    /// Load an ELF image. `static_base` is the image's runtime load address,
    /// zero for the main executable.
    pub fn new(path: &Path, static_base: usize) -> Result<Self> {
        let file = fs::File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let obj = object::File::parse(&*mmap)?;

        // DWARF data may not share the file's byte order
        let endian = match section_data(&obj, ".debug_info") {
            Some((data, _)) if !data.is_empty() => dwarf_endian(&data),
            _ if obj.is_little_endian() => RunTimeEndian::Little,
            _ => RunTimeEndian::Big,
        };

        let has_debug_info = section_data(&obj, ".debug_info")
            .map(|(data, _)| !data.is_empty())
            .unwrap_or(false);

        let dwarf = gimli::Dwarf::load(|id| -> std::result::Result<_, gimli::Error> {
            Ok(load_section(&obj, id.name(), endian))
        })?;

        let loclist = LocList::new(
            DebugLoc::from(load_section(&obj, ".debug_loc", endian)),
            DebugLocLists::from(load_section(&obj, ".debug_loclists", endian)),
        );

        let frame_table = section_data(&obj, ".eh_frame").map(|(data, addr)| {
            FrameTable::new(
                EndianArcSlice::new(Arc::from(&*data), endian),
                addr,
                static_base,
            )
        });

        let symbols = obj
            .symbols()
            .filter_map(|sym| {
                Some(SymbolEntry {
                    name: sym.name().ok()?.to_string(),
                    address: sym.address(),
                    size: sym.size(),
                })
            })
            .collect();

        let mut units = vec![];
        let mut functions = vec![];
        if has_debug_info {
            let parser = UnitParser::new(&dwarf, static_base);
            let mut headers = dwarf.units();
            while let Some(header) = headers.next()? {
                let unit_idx = units.len();
                match parser.parse(header, unit_idx) {
                    Ok((unit, mut unit_fns)) => {
                        units.push(unit);
                        functions.append(&mut unit_fns);
                    }
                    Err(e) => warn!(target: "tracer", "skip malformed unit: {e}"),
                }
            }
        }

        debug!(
            target: "tracer",
            "loaded {:?}: {} units, {} functions, static base {static_base:#x}",
            path,
            units.len(),
            functions.len()
        );

        Ok(Self {
            path: path.to_path_buf(),
            endian,
            entry_point: obj.entry() as usize,
            static_base,
            loclist,
            frame_table,
            units,
            functions,
            lib_functions: vec![],
            libs: vec![],
            symbols,
            function_cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    pub fn endian(&self) -> RunTimeEndian {
        self.endian
    }

    pub fn entry_point(&self) -> usize {
        self.entry_point
    }

    pub fn static_base(&self) -> usize {
        self.static_base
    }

    /// True when the image carries parsed DWARF units.
    pub fn has_debug_info(&self) -> bool {
        !self.units.is_empty()
    }

    /// Fold in a shared library: a full sibling database when the library
    /// has DWARF of its own, otherwise synthetic function entries from its
    /// symbol table.
    pub fn add_shared_library(&mut self, lib: &SharedLibrary) -> Result<()> {
        let data = DebugData::new(&lib.path, lib.static_base)?;

        if data.has_debug_info() {
            debug!(target: "tracer", "shared library {:?} has debug info", lib.path);
            self.libs.push(data);
            return Ok(());
        }

        let libname = lib
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        for sym in &data.symbols {
            if sym.size == 0 {
                continue;
            }
            self.lib_functions.push(FunctionEntry::from_symbol(
                format!("{libname}:{}", sym.name),
                sym.address,
                sym.address + sym.size,
                lib.static_base,
            ));
        }

        Ok(())
    }

    /// The compilation unit containing the (relocated) pc.
    pub fn compilation_unit(&self, pc: usize) -> Result<&Unit> {
        if let Some(unit) = self.units.iter().find(|u| u.contains_pc(pc)) {
            return Ok(unit);
        }
        for lib in &self.libs {
            if let Ok(unit) = lib.compilation_unit(pc) {
                return Ok(unit);
            }
        }
        Err(Error::CompilationUnitNotFound(pc))
    }

    /// The database (this image or one of its libraries) whose units cover
    /// the (relocated) pc.
    fn db_for_pc(&self, pc: usize) -> &DebugData {
        if self.units.iter().any(|u| u.contains_pc(pc)) {
            return self;
        }
        self.libs
            .iter()
            .find(|lib| lib.units.iter().any(|u| u.contains_pc(pc)))
            .unwrap_or(self)
    }

    fn global_pc(&self, pc: usize) -> usize {
        if pc > self.static_base {
            pc - self.static_base
        } else {
            pc
        }
    }

    /// Expression bytes of the location-list entry at `offset` that covers
    /// the (relocated) pc.
    pub fn loclist_entry(
        &self,
        pc: usize,
        offset: u64,
    ) -> Result<gimli::Expression<EndianArcSlice>> {
        let db = self.db_for_pc(pc);
        let unit = db.compilation_unit(pc)?;
        db.loclist.find_entry(
            offset,
            unit.encoding,
            unit.low_pc,
            db.global_pc(pc) as u64,
        )
    }

    /// Relocated breakpoint addresses of every function matching `name`.
    pub fn function_addresses(&self, name: &str, exact: bool) -> Vec<usize> {
        let matches = |fn_name: &str| {
            if exact {
                fn_name == name
            } else {
                fn_name.contains(name)
            }
        };

        let mut addresses: Vec<usize> = self
            .functions
            .iter()
            .chain(self.lib_functions.iter())
            .filter(|f| matches(&f.name))
            .map(|f| f.breakpoint_addr as usize + f.static_base)
            .collect();

        for lib in &self.libs {
            addresses.extend(lib.function_addresses(name, exact));
        }

        addresses
    }

    /// The function containing the (relocated) pc. Results are memoized.
    pub fn function_for_pc(&self, pc: usize) -> Result<FunctionEntry> {
        if let Some(cached) = self.function_cache.lock().expect("not poisoned").get(&pc) {
            return Ok(cached.clone());
        }

        let found = self
            .functions
            .iter()
            .find(|f| f.contains_pc(pc))
            .cloned()
            .or_else(|| {
                self.libs
                    .iter()
                    .find_map(|lib| lib.function_for_pc(pc).ok())
            })
            .or_else(|| self.lib_functions.iter().find(|f| f.contains_pc(pc)).cloned())
            .ok_or(Error::FunctionNotFound(pc))?;

        self.function_cache
            .lock()
            .expect("not poisoned")
            .insert(pc, found.clone());
        Ok(found)
    }

    /// Global variables of the compilation unit containing the (relocated)
    /// pc.
    pub fn globals(&self, pc: usize) -> Result<Vec<VariableEntry>> {
        Ok(self.compilation_unit(pc)?.globals.clone())
    }

    /// `file:line` of the (relocated) pc, when line information exists.
    pub fn find_place(&self, pc: usize) -> Option<String> {
        let db = self.db_for_pc(pc);
        let unit = db.units.iter().find(|u| u.contains_pc(pc))?;
        let row = unit.find_line(db.global_pc(pc) as u64)?;
        Some(unit.render_place(row))
    }

    /// Establish the frame context for the (relocated) pc.
    pub fn frame_context(&self, pc: usize) -> Result<Option<FrameContext>> {
        if let Some(table) = &self.frame_table {
            if let Some(ctx) = table.frame_context(pc)? {
                return Ok(Some(ctx));
            }
        }
        for lib in &self.libs {
            if let Ok(Some(ctx)) = lib.frame_context(pc) {
                return Ok(Some(ctx));
            }
        }
        Ok(None)
    }

    /// Evaluate a function's frame base at the (relocated) pc.
    pub fn frame_base(
        &self,
        func: &FunctionEntry,
        thread: Thread,
        pc: usize,
        regs: &DwarfRegisters,
    ) -> Result<u64> {
        let attr = func
            .frame_base
            .as_ref()
            .ok_or_else(|| Error::MissingAttribute(func.name.clone(), "DW_AT_frame_base"))?;

        let expr = match attr {
            LocationAttr::Inline(expr) => expr.clone(),
            LocationAttr::Loclist(offset) => self.loclist_entry(pc, *offset)?,
        };

        let db = self.db_for_pc(pc);
        let encoding = func
            .unit_idx
            .and_then(|idx| db.units.get(idx))
            .map(|u| u.encoding)
            .unwrap_or(default_encoding());

        let evaluator = ExpressionEvaluator::new(encoding, thread, regs);
        evaluator.evaluate(expr)?.into_value(regs)
    }

    /// Resolve a variable's location attribute into expression bytes,
    /// resolving loclist offsets at the given (relocated) pc.
    pub fn location_expression(
        &self,
        var: &VariableEntry,
        pc: usize,
    ) -> Result<gimli::Expression<EndianArcSlice>> {
        match var.location.as_ref() {
            None => Err(Error::MissingAttribute(var.name.clone(), "DW_AT_location")),
            Some(LocationAttr::Inline(expr)) => Ok(expr.clone()),
            Some(LocationAttr::Loclist(offset)) => self.loclist_entry(pc, *offset),
        }
    }

    /// Encoding of the unit owning a variable, used to evaluate its
    /// location expression.
    pub fn unit_encoding(&self, var: &VariableEntry, pc: usize) -> gimli::Encoding {
        self.db_for_pc(pc)
            .units
            .get(var.unit_idx)
            .map(|u| u.encoding)
            .unwrap_or(default_encoding())
    }

    /// Encoding of the unit containing the (relocated) pc, falling back to
    /// a plain DWARF 4 encoding outside any unit.
    pub fn encoding_for_pc(&self, pc: usize) -> gimli::Encoding {
        self.compilation_unit(pc)
            .map(|u| u.encoding)
            .unwrap_or(default_encoding())
    }
}

pub fn default_encoding() -> gimli::Encoding {
    gimli::Encoding {
        format: gimli::Format::Dwarf32,
        version: 4,
        address_size: crate::arch::PTR_SIZE as u8,
    }
}

fn section_data<'a>(obj: &'a object::File, name: &str) -> Option<(Cow<'a, [u8]>, u64)> {
    let section = obj
        .section_by_name(name)
        .or_else(|| obj.section_by_name(&format!(".z{}", &name[1..])))?;
    let addr = section.address();
    section.uncompressed_data().ok().map(|data| (data, addr))
}

fn load_section(obj: &object::File, name: &str, endian: RunTimeEndian) -> EndianArcSlice {
    let data = section_data(obj, name)
        .map(|(data, _)| data)
        .unwrap_or(Cow::Borrowed(&[]));
    EndianArcSlice::new(Arc::from(&*data), endian)
}

#[cfg(test)]
mod test {
    use super::*;
    use once_cell::sync::Lazy;

    // the test binary's own debug info, parsed once for every test
    static OWN_BINARY: Lazy<DebugData> = Lazy::new(|| {
        let exe = std::env::current_exe().unwrap();
        DebugData::new(&exe, 0).unwrap()
    });

    #[test]
    fn test_load_own_binary() {
        let data = &*OWN_BINARY;

        // test binaries are built with debug info
        assert!(data.has_debug_info());
        assert!(data.entry_point() > 0);
        assert_eq!(data.static_base(), 0);
        assert!(!data.functions.is_empty());
    }

    #[test]
    fn test_function_queries_on_own_binary() {
        let data = &*OWN_BINARY;

        // this very function is in the debug info of the test binary
        let addrs = data.function_addresses("test_function_queries_on_own_binary", false);
        assert!(!addrs.is_empty());

        let named: Vec<_> = data
            .functions
            .iter()
            .filter(|f| f.name.contains("test_function_queries_on_own_binary"))
            .collect();
        assert!(!named.is_empty());

        let func = named[0];
        let pc = (func.low_pc as usize + func.high_pc as usize) / 2;
        let resolved = data.function_for_pc(pc).unwrap();
        assert_eq!(resolved.name, func.name);

        // cache property: a second query returns the same entry
        let resolved2 = data.function_for_pc(pc).unwrap();
        assert_eq!(resolved2.name, resolved.name);
        assert_eq!(resolved2.low_pc, resolved.low_pc);

        // the breakpoint address lies inside the function
        assert!(resolved.breakpoint_addr >= resolved.low_pc);
        assert!(resolved.breakpoint_addr < resolved.high_pc);
    }

    #[test]
    fn test_compilation_unit_for_pc() {
        let data = &*OWN_BINARY;

        let func = data
            .functions
            .iter()
            .find(|f| f.name.contains("test_compilation_unit_for_pc"))
            .expect("own function present");
        let pc = func.low_pc as usize + 1;

        let unit = data.compilation_unit(pc).unwrap();
        assert!(unit.contains_pc(pc));

        // a pc far outside any mapping has no unit
        assert!(data.compilation_unit(0x10).is_err());
    }

    #[test]
    fn test_frame_context_on_own_binary() {
        let data = &*OWN_BINARY;

        let func = data
            .functions
            .iter()
            .find(|f| f.name.contains("test_frame_context_on_own_binary"))
            .expect("own function present");
        let pc = func.low_pc as usize + 1;

        let ctx = data.frame_context(pc).unwrap();
        assert!(ctx.is_some());
    }
}
