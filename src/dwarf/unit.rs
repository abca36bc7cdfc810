//! Eagerly parsed compilation-unit data: ranges, line rows, function
//! entries and global variables. One pass over the DWARF tree at load time
//! makes every later pc query a lookup over plain vectors.

use crate::arch::PTR_SIZE;
use crate::dwarf::frame::Expression;
use crate::dwarf::EndianArcSlice;
use crate::error::Result;
use fallible_iterator::FallibleIterator;
use gimli::{
    AttributeValue, DW_AT_byte_size, DW_AT_frame_base, DW_AT_high_pc, DW_AT_location,
    DW_AT_low_pc, DW_AT_name, DW_AT_type, DW_TAG_const_type, DW_TAG_formal_parameter,
    DW_TAG_pointer_type, DW_TAG_reference_type, DW_TAG_subprogram, DW_TAG_variable, DwTag,
    Encoding, Range, Reader, UnitOffset,
};
use std::num::NonZeroU64;
use std::path::PathBuf;

/// A variable's location attribute, decided at parse time.
#[derive(Debug, Clone)]
pub enum LocationAttr {
    /// Inline DWARF expression bytes.
    Inline(Expression),
    /// Offset into the location lists, resolved at read time with the
    /// current pc.
    Loclist(u64),
}

impl LocationAttr {
    /// True if the expression starts with the given opcode.
    pub fn starts_with(&self, opcode: gimli::DwOp) -> bool {
        match self {
            LocationAttr::Inline(expr) => expr
                .0
                .to_slice()
                .map(|bytes| bytes.first() == Some(&opcode.0))
                .unwrap_or(false),
            LocationAttr::Loclist(_) => false,
        }
    }
}

/// One row of the line program.
#[derive(Debug, Clone, Copy)]
pub struct LineRow {
    pub address: u64,
    pub file_index: u64,
    pub line: u64,
    pub is_stmt: bool,
}

/// Debug information about a variable or a formal parameter.
#[derive(Debug, Clone)]
pub struct VariableEntry {
    pub name: String,
    pub type_name: Option<String>,
    /// Byte size of the variable's storage.
    pub byte_size: u64,
    /// Byte size of the pointee when `is_pointer`.
    pub deref_size: u64,
    pub is_pointer: bool,
    pub location: Option<LocationAttr>,
    pub static_base: usize,
    pub unit_idx: usize,
}

/// Debug information about a function.
#[derive(Debug, Clone)]
pub struct FunctionEntry {
    pub name: String,
    pub low_pc: u64,
    pub high_pc: u64,
    pub static_base: usize,
    /// Link-time address of the first statement after the prologue; where a
    /// breakpoint on this function lands.
    pub breakpoint_addr: u64,
    pub frame_base: Option<LocationAttr>,
    pub variables: Vec<VariableEntry>,
    /// Index of the owning unit; `None` for synthetic entries made from a
    /// shared library's symbol table.
    pub unit_idx: Option<usize>,
}

impl FunctionEntry {
    /// A synthetic entry for a shared-library symbol without DWARF.
    pub fn from_symbol(name: String, low_pc: u64, high_pc: u64, static_base: usize) -> Self {
        Self {
            name,
            low_pc,
            high_pc,
            static_base,
            breakpoint_addr: low_pc,
            frame_base: None,
            variables: vec![],
            unit_idx: None,
        }
    }

    /// True when the (relocated) pc falls into the function body.
    pub fn contains_pc(&self, pc: usize) -> bool {
        let low = self.low_pc as usize + self.static_base;
        let high = self.high_pc as usize + self.static_base;
        pc >= low && pc < high
    }
}

/// An eagerly parsed compilation unit.
#[derive(Debug)]
pub struct Unit {
    pub name: Option<String>,
    pub encoding: Encoding,
    pub low_pc: u64,
    pub ranges: Vec<Range>,
    /// Line rows sorted by address.
    pub lines: Vec<LineRow>,
    pub files: Vec<PathBuf>,
    pub globals: Vec<VariableEntry>,
    pub static_base: usize,
}

impl Unit {
    /// True when the (relocated) pc falls into one of the unit's ranges.
    pub fn contains_pc(&self, pc: usize) -> bool {
        self.ranges.iter().any(|r| {
            pc >= r.begin as usize + self.static_base && pc < r.end as usize + self.static_base
        })
    }

    /// The line row covering the (link-time) pc.
    pub fn find_line(&self, pc: u64) -> Option<&LineRow> {
        let idx = self.lines.partition_point(|row| row.address <= pc);
        if idx == 0 {
            return None;
        }
        Some(&self.lines[idx - 1])
    }

    /// Render `file:line` for a line row.
    pub fn render_place(&self, row: &LineRow) -> String {
        let file = self
            .files
            .get(row.file_index as usize)
            .and_then(|f| f.file_name())
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| "?".to_string());
        format!("{}:{}", file, row.line)
    }
}

pub struct UnitParser<'a> {
    dwarf: &'a gimli::Dwarf<EndianArcSlice>,
    static_base: usize,
}

impl<'a> UnitParser<'a> {
    pub fn new(dwarf: &'a gimli::Dwarf<EndianArcSlice>, static_base: usize) -> Self {
        Self { dwarf, static_base }
    }

    /// Parse one compilation unit into its eager form plus the function
    /// entries found inside it.
    pub fn parse(
        &self,
        header: gimli::UnitHeader<EndianArcSlice>,
        unit_idx: usize,
    ) -> Result<(Unit, Vec<FunctionEntry>)> {
        let unit = self.dwarf.unit(header)?;

        let name = unit
            .name
            .as_ref()
            .and_then(|n| n.to_string_lossy().ok().map(|s| s.to_string()));

        let mut lines = vec![];
        let mut files = vec![];
        if let Some(ref lp) = unit.line_program {
            let mut rows = lp.clone().rows();
            while let Some((_, row)) = rows.next_row()? {
                lines.push(LineRow {
                    address: row.address(),
                    file_index: row.file_index(),
                    line: row.line().map(NonZeroU64::get).unwrap_or(0),
                    is_stmt: row.is_stmt(),
                });
            }
            files = self.parse_files(&unit, rows.header())?;
        }
        lines.sort_unstable_by_key(|row| row.address);

        let mut ranges = self.dwarf.unit_ranges(&unit)?.collect::<Vec<_>>()?;
        ranges.sort_unstable_by_key(|r| r.begin);

        let mut out = Unit {
            name,
            encoding: unit.encoding(),
            low_pc: unit.low_pc,
            ranges,
            lines,
            files,
            globals: vec![],
            static_base: self.static_base,
        };

        let mut functions: Vec<FunctionEntry> = vec![];
        // depth of the subprogram whose leading parameter block is being
        // collected, and whether a variable was already taken (collection
        // stops at the first non-parameter child after that)
        let mut fn_depth: Option<(isize, bool)> = None;
        let mut depth = 0isize;

        let mut cursor = unit.entries();
        while let Some((delta, die)) = cursor.next_dfs()? {
            depth += delta;

            if let Some((at_depth, _)) = fn_depth {
                if depth <= at_depth {
                    fn_depth = None;
                }
            }

            if let Some((at_depth, saw_var)) = fn_depth {
                if depth == at_depth + 1 {
                    if saw_var && die.tag() != DW_TAG_formal_parameter {
                        fn_depth = None;
                    } else if matches!(die.tag(), DW_TAG_variable | DW_TAG_formal_parameter) {
                        if let Some((var, _)) = self.parse_variable(&unit, die, unit_idx)? {
                            let func = functions.last_mut().expect("collecting for function");
                            func.variables.push(var);
                            fn_depth = Some((at_depth, true));
                        }
                    }
                }
            }

            match die.tag() {
                DW_TAG_subprogram => {
                    if let Some(func) = self.parse_function(&unit, die, unit_idx, &out.lines)? {
                        functions.push(func);
                        fn_depth = Some((depth, false));
                    }
                }
                // a variable anywhere in the unit is a global candidate when
                // its storage is a fixed address
                DW_TAG_variable => {
                    if let Some((var, raw_size)) = self.parse_variable(&unit, die, unit_idx)? {
                        let fixed_addr = var
                            .location
                            .as_ref()
                            .map(|loc| loc.starts_with(gimli::DW_OP_addr))
                            .unwrap_or(false);
                        if fixed_addr && raw_size > 0 && var.name != "?" {
                            out.globals.push(var);
                        }
                    }
                }
                _ => {}
            }
        }

        Ok((out, functions))
    }

    fn parse_files(
        &self,
        unit: &gimli::Unit<EndianArcSlice>,
        header: &gimli::LineProgramHeader<EndianArcSlice>,
    ) -> Result<Vec<PathBuf>> {
        let mut files = vec![];
        match header.file(0) {
            Some(file) => files.push(self.render_file_path(unit, file, header)?),
            None => files.push(PathBuf::default()),
        }
        let mut index = 1;
        while let Some(file) = header.file(index) {
            files.push(self.render_file_path(unit, file, header)?);
            index += 1;
        }
        Ok(files)
    }

    fn render_file_path(
        &self,
        unit: &gimli::Unit<EndianArcSlice>,
        file: &gimli::FileEntry<EndianArcSlice>,
        header: &gimli::LineProgramHeader<EndianArcSlice>,
    ) -> Result<PathBuf> {
        let mut path = if let Some(ref comp_dir) = unit.comp_dir {
            PathBuf::from(comp_dir.to_string_lossy()?.as_ref())
        } else {
            PathBuf::new()
        };

        if file.directory_index() != 0 {
            if let Some(directory) = file.directory(header) {
                path.push(
                    self.dwarf
                        .attr_string(unit, directory)?
                        .to_string_lossy()?
                        .as_ref(),
                );
            }
        }

        path.push(
            self.dwarf
                .attr_string(unit, file.path_name())?
                .to_string_lossy()?
                .as_ref(),
        );

        Ok(path)
    }

    fn parse_function(
        &self,
        unit: &gimli::Unit<EndianArcSlice>,
        die: &gimli::DebuggingInformationEntry<EndianArcSlice>,
        unit_idx: usize,
        lines: &[LineRow],
    ) -> Result<Option<FunctionEntry>> {
        let Some(name) = self.die_name(unit, die)? else {
            return Ok(None);
        };

        let low_pc = match die.attr_value(DW_AT_low_pc)? {
            Some(AttributeValue::Addr(addr)) => addr,
            Some(AttributeValue::Udata(addr)) => addr,
            _ => return Ok(None), // declaration without code
        };
        let high_pc = match die.attr_value(DW_AT_high_pc)? {
            Some(AttributeValue::Addr(addr)) => addr,
            Some(AttributeValue::Udata(offset)) => low_pc + offset,
            Some(AttributeValue::Data1(offset)) => low_pc + offset as u64,
            Some(AttributeValue::Data2(offset)) => low_pc + offset as u64,
            Some(AttributeValue::Data4(offset)) => low_pc + offset as u64,
            Some(AttributeValue::Data8(offset)) => low_pc + offset,
            _ => low_pc,
        };

        let breakpoint_addr = lines
            .iter()
            .find(|row| row.address > low_pc && row.address < high_pc && row.is_stmt)
            .map(|row| row.address)
            .unwrap_or(low_pc);

        Ok(Some(FunctionEntry {
            name,
            low_pc,
            high_pc,
            static_base: self.static_base,
            breakpoint_addr,
            frame_base: die
                .attr(DW_AT_frame_base)?
                .and_then(|attr| self.location_attr(attr.value())),
            variables: vec![],
            unit_idx: Some(unit_idx),
        }))
    }

    /// Parse a variable or formal parameter DIE. Returns the entry together
    /// with the declared (pre-default) type size.
    fn parse_variable(
        &self,
        unit: &gimli::Unit<EndianArcSlice>,
        die: &gimli::DebuggingInformationEntry<EndianArcSlice>,
        unit_idx: usize,
    ) -> Result<Option<(VariableEntry, u64)>> {
        if die.tag() != DW_TAG_variable && die.tag() != DW_TAG_formal_parameter {
            return Ok(None);
        }

        let name = self
            .die_name(unit, die)?
            .unwrap_or_else(|| "?".to_string());

        let mut byte_size = 0;
        let mut deref_size = 0;
        let mut type_name = None;
        let mut is_pointer = false;

        if let Some(type_off) = self.type_ref(die)? {
            if let Some(ty) = self.resolve_type(unit, type_off)? {
                byte_size = ty.byte_size;

                if ty.tag == DW_TAG_pointer_type || ty.tag == DW_TAG_reference_type {
                    is_pointer = true;
                    let pointee = match ty.type_ref {
                        Some(off) => self.resolve_type(unit, off)?,
                        None => None,
                    };
                    match pointee {
                        Some(pointee) => {
                            type_name =
                                Some(format!("{}*", pointee.name.as_deref().unwrap_or("?")));
                            deref_size = pointee.byte_size;
                        }
                        None => type_name = Some("void*".to_string()),
                    }
                } else {
                    type_name = ty.name;
                }
            }
        }

        let raw_size = byte_size;
        if byte_size == 0 {
            byte_size = PTR_SIZE as u64;
        }
        if deref_size == 0 {
            deref_size = byte_size;
        }

        let location = die
            .attr(DW_AT_location)?
            .and_then(|attr| self.location_attr(attr.value()));

        Ok(Some((
            VariableEntry {
                name,
                type_name,
                byte_size,
                deref_size,
                is_pointer,
                location,
                static_base: self.static_base,
                unit_idx,
            },
            raw_size,
        )))
    }

    fn location_attr(&self, value: AttributeValue<EndianArcSlice>) -> Option<LocationAttr> {
        match value {
            AttributeValue::Exprloc(expr) => Some(LocationAttr::Inline(expr)),
            AttributeValue::Block(block) => Some(LocationAttr::Inline(gimli::Expression(block))),
            AttributeValue::LocationListsRef(offset) => {
                Some(LocationAttr::Loclist(offset.0 as u64))
            }
            AttributeValue::SecOffset(offset) => Some(LocationAttr::Loclist(offset as u64)),
            AttributeValue::Data4(offset) => Some(LocationAttr::Loclist(offset as u64)),
            AttributeValue::Data8(offset) => Some(LocationAttr::Loclist(offset)),
            _ => None,
        }
    }

    fn die_name(
        &self,
        unit: &gimli::Unit<EndianArcSlice>,
        die: &gimli::DebuggingInformationEntry<EndianArcSlice>,
    ) -> Result<Option<String>> {
        let Some(attr) = die.attr(DW_AT_name)? else {
            return Ok(None);
        };
        let Ok(name) = self.dwarf.attr_string(unit, attr.value()) else {
            return Ok(None);
        };
        Ok(name.to_string_lossy().ok().map(|s| s.to_string()))
    }

    fn type_ref(
        &self,
        die: &gimli::DebuggingInformationEntry<EndianArcSlice>,
    ) -> Result<Option<UnitOffset>> {
        match die.attr_value(DW_AT_type)? {
            Some(AttributeValue::UnitRef(offset)) => Ok(Some(offset)),
            _ => Ok(None),
        }
    }

    /// Follow a type reference, skipping const wrappers.
    fn resolve_type(
        &self,
        unit: &gimli::Unit<EndianArcSlice>,
        offset: UnitOffset,
    ) -> Result<Option<TypeInfo>> {
        let mut offset = offset;
        loop {
            let Ok(die) = unit.entry(offset) else {
                return Ok(None);
            };

            if die.tag() == DW_TAG_const_type {
                match self.type_ref(&die)? {
                    Some(next) => {
                        offset = next;
                        continue;
                    }
                    None => return Ok(None),
                }
            }

            let byte_size = match die.attr_value(DW_AT_byte_size)? {
                Some(value) => value.udata_value().unwrap_or(0),
                None => 0,
            };

            return Ok(Some(TypeInfo {
                tag: die.tag(),
                name: self.die_name(unit, &die)?,
                byte_size,
                type_ref: self.type_ref(&die)?,
            }));
        }
    }
}

struct TypeInfo {
    tag: DwTag,
    name: Option<String>,
    byte_size: u64,
    type_ref: Option<UnitOffset>,
}
