//! Array schema
//!
//! Immutable description of one array (dense or sparse) or metadata store,
//! validated once at build time.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TileError};

use super::{CellValNum, Compressor, Datatype, Layout, Subarray, COORDS, KEY};

/// Physical flavour of a schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaKind {
    /// Every domain cell exists; coordinates are implicit
    Dense,
    /// Only written cells exist; coordinates are stored per cell
    Sparse,
    /// Metadata store: cells are identified by a string key
    Keyed,
}

/// One named, typed attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub datatype: Datatype,
    pub cell_val_num: CellValNum,
    pub compressor: Compressor,
    /// Bytes of one empty cell (dense cells covered by no fragment)
    pub fill_value: Vec<u8>,
}

impl Attribute {
    /// Size in bytes of one cell, `None` for variable-length attributes
    pub fn cell_size(&self) -> Option<usize> {
        match self.cell_val_num {
            CellValNum::Fixed(n) => Some(n as usize * self.datatype.size()),
            CellValNum::Var => None,
        }
    }

    pub fn is_var(&self) -> bool {
        self.cell_val_num.is_var()
    }
}

/// One named dimension with its inclusive domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub domain: (i64, i64),
    pub tile_extent: Option<i64>,
}

/// Schema of an array or metadata store
///
/// Attributes are addressed by *column index*: `0..attribute_num()` are the
/// user attributes, `attribute_num()` is the implicit coordinates column
/// (`__coords`) or key column (`__key`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArraySchema {
    name: String,
    kind: SchemaKind,
    attributes: Vec<Attribute>,
    dimensions: Vec<Dimension>,
    coords_type: Datatype,
    coords_compressor: Compressor,
    cell_order: Layout,
    tile_order: Layout,
    capacity: u64,
}

impl ArraySchema {
    /// Default number of cells per sparse tile
    pub const DEFAULT_CAPACITY: u64 = 10_000;

    /// Builder for dense and sparse arrays
    pub fn builder(name: impl Into<String>) -> ArraySchemaBuilder {
        ArraySchemaBuilder::new(name.into(), SchemaKind::Sparse)
    }

    /// Builder for keyed metadata stores
    pub fn metadata_builder(name: impl Into<String>) -> ArraySchemaBuilder {
        ArraySchemaBuilder::new(name.into(), SchemaKind::Keyed)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Same schema under another name (objects that were moved)
    pub(crate) fn with_name(&self, name: &str) -> ArraySchema {
        ArraySchema {
            name: name.to_string(),
            ..self.clone()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SchemaKind {
        self.kind
    }

    pub fn is_dense(&self) -> bool {
        self.kind == SchemaKind::Dense
    }

    pub fn is_keyed(&self) -> bool {
        self.kind == SchemaKind::Keyed
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn attribute_num(&self) -> usize {
        self.attributes.len()
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    pub fn dim_num(&self) -> usize {
        self.dimensions.len()
    }

    pub fn coords_type(&self) -> Datatype {
        self.coords_type
    }

    pub fn cell_order(&self) -> Layout {
        self.cell_order
    }

    pub fn tile_order(&self) -> Layout {
        self.tile_order
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// The whole domain as a subarray
    pub fn domain(&self) -> Subarray {
        self.dimensions.iter().map(|d| d.domain).collect()
    }

    /// Tile extents, if every dimension declares one
    pub fn tile_extents(&self) -> Option<Vec<i64>> {
        self.dimensions.iter().map(|d| d.tile_extent).collect()
    }

    /// Column index of the coordinates / key column
    pub fn coords_column(&self) -> usize {
        self.attributes.len()
    }

    /// Whether cells carry stored coordinates (sparse) or keys (metadata)
    pub fn has_coords_column(&self) -> bool {
        self.kind != SchemaKind::Dense
    }

    /// Name of the coordinates / key column
    pub fn coords_name(&self) -> &'static str {
        if self.is_keyed() {
            KEY
        } else {
            COORDS
        }
    }

    /// Size in bytes of one cell of coordinates
    pub fn coords_size(&self) -> usize {
        self.dimensions.len() * self.coords_type.size()
    }

    /// Look up a column index by name (attribute, `__coords` or `__key`)
    pub fn column_index(&self, name: &str) -> Option<usize> {
        if name == self.coords_name() {
            return Some(self.coords_column());
        }
        self.attributes.iter().position(|a| a.name == name)
    }

    /// Cell size of a column, `None` if variable-length
    pub fn column_cell_size(&self, column: usize) -> Option<usize> {
        match self.attributes.get(column) {
            Some(attr) => attr.cell_size(),
            None if self.is_keyed() => None,
            None => Some(self.coords_size()),
        }
    }

    pub fn column_is_var(&self, column: usize) -> bool {
        self.column_cell_size(column).is_none()
    }

    /// Value type of a column
    pub fn column_datatype(&self, column: usize) -> Datatype {
        match self.attributes.get(column) {
            Some(attr) => attr.datatype,
            None if self.is_keyed() => Datatype::Char,
            None => self.coords_type,
        }
    }

    pub fn column_compressor(&self, column: usize) -> Compressor {
        match self.attributes.get(column) {
            Some(attr) => attr.compressor,
            None => self.coords_compressor,
        }
    }

    pub fn column_name(&self, column: usize) -> &str {
        match self.attributes.get(column) {
            Some(attr) => &attr.name,
            None => self.coords_name(),
        }
    }

    /// Columns stored in every fragment, in file order
    pub fn stored_columns(&self) -> Vec<usize> {
        let n = if self.has_coords_column() {
            self.attributes.len() + 1
        } else {
            self.attributes.len()
        };
        (0..n).collect()
    }

    /// Resolve a list of attribute names into column indices.
    ///
    /// An empty list selects every attribute, plus the coordinates / key
    /// column when the schema stores one.
    pub fn resolve_columns(&self, names: &[&str]) -> Result<Vec<usize>> {
        if names.is_empty() {
            return Ok(self.stored_columns());
        }

        let mut seen = HashSet::new();
        names
            .iter()
            .map(|name| {
                let column = self.column_index(name).ok_or_else(|| {
                    TileError::InvalidArgument(format!(
                        "Unknown attribute '{}' in '{}'",
                        name, self.name
                    ))
                })?;
                if !seen.insert(column) {
                    return Err(TileError::InvalidArgument(format!(
                        "Attribute '{}' selected twice",
                        name
                    )));
                }
                Ok(column)
            })
            .collect()
    }

    /// Check that `subarray` is a well-formed box inside the domain
    pub fn check_subarray(&self, subarray: &[(i64, i64)]) -> Result<()> {
        if subarray.len() != self.dimensions.len() {
            return Err(TileError::InvalidArgument(format!(
                "Subarray has {} ranges, array '{}' has {} dimensions",
                subarray.len(),
                self.name,
                self.dimensions.len()
            )));
        }
        for (&(lo, hi), dim) in subarray.iter().zip(&self.dimensions) {
            if lo > hi || lo < dim.domain.0 || hi > dim.domain.1 {
                return Err(TileError::InvalidArgument(format!(
                    "Range [{}, {}] outside domain [{}, {}] of dimension '{}'",
                    lo, hi, dim.domain.0, dim.domain.1, dim.name
                )));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Check every schema invariant
    pub fn validate(&self) -> Result<()> {
        check_object_name(&self.name)?;

        if self.attributes.is_empty() {
            return invalid("at least one attribute is required");
        }
        if self.capacity == 0 {
            return invalid("capacity must be positive");
        }

        let mut names = HashSet::new();
        for attr in &self.attributes {
            check_field_name(&attr.name)?;
            if !names.insert(attr.name.as_str()) {
                return invalid(&format!("duplicate attribute name '{}'", attr.name));
            }
            check_fill_value(attr)?;
        }

        if self.is_keyed() {
            if !self.dimensions.is_empty() {
                return invalid("metadata stores have no dimensions");
            }
            return Ok(());
        }

        if self.dimensions.is_empty() {
            return invalid("at least one dimension is required");
        }
        let (type_lo, type_hi) = self.coords_type.coordinate_range().ok_or_else(|| {
            TileError::InvalidSchema(format!(
                "coordinates type {:?} is not an integer type",
                self.coords_type
            ))
        })?;
        if self.tile_order == Layout::Hilbert {
            return invalid("tile order must be row-major or column-major");
        }

        for dim in &self.dimensions {
            check_field_name(&dim.name)?;
            if !names.insert(dim.name.as_str()) {
                return invalid(&format!("name '{}' used twice", dim.name));
            }
            let (lo, hi) = dim.domain;
            if lo > hi || lo < type_lo || hi > type_hi {
                return invalid(&format!(
                    "domain [{}, {}] of '{}' is empty or exceeds the coordinates type",
                    lo, hi, dim.name
                ));
            }
            if (hi as i128 - lo as i128) >= i64::MAX as i128 {
                return invalid(&format!("domain of '{}' is too wide", dim.name));
            }
            if let Some(ext) = dim.tile_extent {
                if ext < 1 || ext as i128 > hi as i128 - lo as i128 + 1 {
                    return invalid(&format!(
                        "tile extent {} of '{}' does not fit the domain",
                        ext, dim.name
                    ));
                }
            }
        }

        let extents = self.tile_extents();
        match self.kind {
            SchemaKind::Dense => {
                let extents = extents.ok_or_else(|| {
                    TileError::InvalidSchema("dense arrays need a tile extent per dimension".into())
                })?;
                for (dim, ext) in self.dimensions.iter().zip(extents) {
                    if (dim.domain.1 - dim.domain.0 + 1) % ext != 0 {
                        return invalid(&format!(
                            "tile extent {} does not evenly tile dimension '{}'",
                            ext, dim.name
                        ));
                    }
                }
                if self.cell_order == Layout::Hilbert {
                    return invalid("dense arrays need a row- or column-major cell order");
                }
            }
            _ => {
                if extents.is_none() && self.dimensions.iter().any(|d| d.tile_extent.is_some()) {
                    return invalid("tile extents must be given for all dimensions or none");
                }
            }
        }

        Ok(())
    }
}

fn invalid<T>(msg: &str) -> Result<T> {
    Err(TileError::InvalidSchema(msg.to_string()))
}

/// Array names are workspace-relative paths
pub(crate) fn check_object_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name.starts_with('/')
        || name
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == ".." || part.starts_with("__"));
    if bad {
        return Err(TileError::InvalidSchema(format!("invalid object name '{}'", name)));
    }
    Ok(())
}

fn check_field_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && !name.starts_with("__")
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !ok {
        return invalid(&format!("invalid attribute/dimension name '{}'", name));
    }
    Ok(())
}

fn check_fill_value(attr: &Attribute) -> Result<()> {
    let ok = match attr.cell_val_num {
        CellValNum::Fixed(0) => return invalid(&format!("'{}' has zero values per cell", attr.name)),
        CellValNum::Fixed(n) => attr.fill_value.len() == n as usize * attr.datatype.size(),
        CellValNum::Var => {
            !attr.fill_value.is_empty() && attr.fill_value.len() % attr.datatype.size() == 0
        }
    };
    if !ok {
        return invalid(&format!("fill value of '{}' does not match its cell size", attr.name));
    }
    Ok(())
}

// =============================================================================
// Builder
// =============================================================================

/// Builder mirroring the parallel-slot layout of a schema: `types` and
/// `compressors` carry one slot per attribute plus a final slot for the
/// coordinates (or key) column.
pub struct ArraySchemaBuilder {
    name: String,
    kind: SchemaKind,
    attributes: Vec<String>,
    types: Vec<Datatype>,
    cell_val_nums: Option<Vec<CellValNum>>,
    compressors: Option<Vec<Compressor>>,
    fill_values: Vec<(String, Vec<u8>)>,
    dimensions: Vec<String>,
    domain: Subarray,
    tile_extents: Option<Vec<i64>>,
    cell_order: Layout,
    tile_order: Layout,
    capacity: u64,
}

impl ArraySchemaBuilder {
    fn new(name: String, kind: SchemaKind) -> Self {
        Self {
            name,
            kind,
            attributes: Vec::new(),
            types: Vec::new(),
            cell_val_nums: None,
            compressors: None,
            fill_values: Vec::new(),
            dimensions: Vec::new(),
            domain: Vec::new(),
            tile_extents: None,
            cell_order: Layout::RowMajor,
            tile_order: Layout::RowMajor,
            capacity: ArraySchema::DEFAULT_CAPACITY,
        }
    }

    /// Dense or sparse (ignored for metadata stores)
    pub fn kind(mut self, kind: SchemaKind) -> Self {
        if self.kind != SchemaKind::Keyed {
            self.kind = kind;
        }
        self
    }

    pub fn dense(self, dense: bool) -> Self {
        self.kind(if dense { SchemaKind::Dense } else { SchemaKind::Sparse })
    }

    pub fn attributes(mut self, names: &[&str]) -> Self {
        self.attributes = names.iter().map(|s| s.to_string()).collect();
        self
    }

    /// One type per attribute, then the coordinates type
    pub fn types(mut self, types: &[Datatype]) -> Self {
        self.types = types.to_vec();
        self
    }

    /// One multiplicity per attribute (default: one value per cell)
    pub fn cell_val_nums(mut self, nums: &[CellValNum]) -> Self {
        self.cell_val_nums = Some(nums.to_vec());
        self
    }

    /// One compressor per attribute, then the coordinates compressor
    pub fn compressors(mut self, compressors: &[Compressor]) -> Self {
        self.compressors = Some(compressors.to_vec());
        self
    }

    /// Override the empty value of one attribute
    pub fn fill_value(mut self, attribute: &str, value: &[u8]) -> Self {
        self.fill_values.push((attribute.to_string(), value.to_vec()));
        self
    }

    pub fn dimensions(mut self, names: &[&str]) -> Self {
        self.dimensions = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn domain(mut self, domain: &[(i64, i64)]) -> Self {
        self.domain = domain.to_vec();
        self
    }

    pub fn tile_extents(mut self, extents: &[i64]) -> Self {
        self.tile_extents = Some(extents.to_vec());
        self
    }

    pub fn cell_order(mut self, order: Layout) -> Self {
        self.cell_order = order;
        self
    }

    pub fn tile_order(mut self, order: Layout) -> Self {
        self.tile_order = order;
        self
    }

    pub fn capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    /// Assemble and validate the schema
    pub fn build(self) -> Result<ArraySchema> {
        let attr_num = self.attributes.len();

        // Key column of metadata stores is always Char; its type slot is optional
        let keyed = self.kind == SchemaKind::Keyed;
        let mut types = self.types;
        if keyed && types.len() == attr_num {
            types.push(Datatype::Char);
        }
        if types.len() != attr_num + 1 {
            return invalid(&format!(
                "expected {} types (attributes + coordinates), got {}",
                attr_num + 1,
                types.len()
            ));
        }

        let compressors = self
            .compressors
            .unwrap_or_else(|| vec![Compressor::None; attr_num + 1]);
        if compressors.len() != attr_num + 1 {
            return invalid(&format!(
                "expected {} compressors (attributes + coordinates), got {}",
                attr_num + 1,
                compressors.len()
            ));
        }

        let cell_val_nums = self
            .cell_val_nums
            .unwrap_or_else(|| vec![CellValNum::Fixed(1); attr_num]);
        if cell_val_nums.len() != attr_num {
            return invalid(&format!(
                "expected {} cell value counts, got {}",
                attr_num,
                cell_val_nums.len()
            ));
        }

        if self.dimensions.len() != self.domain.len() {
            return invalid("domain needs exactly one range per dimension");
        }
        if let Some(ext) = &self.tile_extents {
            if ext.len() != self.dimensions.len() {
                return invalid("tile extents need exactly one value per dimension");
            }
        }

        let attributes: Vec<Attribute> = self
            .attributes
            .into_iter()
            .enumerate()
            .map(|(i, name)| {
                let datatype = types[i];
                let cell_val_num = cell_val_nums[i];
                let fill_value = match cell_val_num {
                    CellValNum::Fixed(n) => datatype.empty_value().repeat(n as usize),
                    CellValNum::Var => datatype.empty_value(),
                };
                Attribute {
                    name,
                    datatype,
                    cell_val_num,
                    compressor: compressors[i],
                    fill_value,
                }
            })
            .collect();

        let dimensions = self
            .dimensions
            .into_iter()
            .enumerate()
            .map(|(i, name)| Dimension {
                name,
                domain: self.domain[i],
                tile_extent: self.tile_extents.as_ref().map(|e| e[i]),
            })
            .collect();

        let mut schema = ArraySchema {
            name: self.name,
            kind: self.kind,
            attributes,
            dimensions,
            coords_type: if keyed { Datatype::Char } else { types[attr_num] },
            coords_compressor: compressors[attr_num],
            cell_order: if keyed { Layout::RowMajor } else { self.cell_order },
            tile_order: if keyed { Layout::RowMajor } else { self.tile_order },
            capacity: self.capacity,
        };

        for (attr_name, value) in self.fill_values {
            let attr = schema
                .attributes
                .iter_mut()
                .find(|a| a.name == attr_name)
                .ok_or_else(|| {
                    TileError::InvalidSchema(format!("fill value for unknown attribute '{}'", attr_name))
                })?;
            attr.fill_value = value;
        }

        schema.validate()?;
        Ok(schema)
    }
}
