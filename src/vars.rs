//! Observable target variables and their value conversions.

use std::collections::HashMap;
use std::sync::Mutex;

/// Addresses below this are not backed by target RAM; reads from them
/// are rejected up front. Failed address parses resolve to 0 and land
/// below this bound.
pub const MIN_ADDRESS: u32 = 0x2000_0000;

/// Primitive type of a sampled variable. Determines both the read size
/// and the interpretation of the raw 32-bit word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum VarType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    Bool,
    Unknown,
}

impl VarType {
    /// Byte size read from the target for this type.
    pub fn size(self) -> u8 {
        match self {
            VarType::U8 | VarType::I8 | VarType::Bool => 1,
            VarType::U16 | VarType::I16 => 2,
            VarType::U32 | VarType::I32 | VarType::F32 | VarType::Unknown => 4,
        }
    }
}

/// Reinterprets a raw 32-bit word as a plottable value. Pure bit
/// reinterpretation; no scaling.
pub fn raw_to_double(ty: VarType, raw: u32) -> f64 {
    match ty {
        VarType::U8 => (raw as u8) as f64,
        VarType::I8 => (raw as u8 as i8) as f64,
        VarType::U16 => (raw as u16) as f64,
        VarType::I16 => (raw as u16 as i16) as f64,
        VarType::U32 | VarType::Unknown => raw as f64,
        VarType::I32 => (raw as i32) as f64,
        VarType::F32 => f32::from_bits(raw) as f64,
        VarType::Bool => {
            if raw & 0xff != 0 {
                1.0
            } else {
                0.0
            }
        }
    }
}

/// Inverse of [`raw_to_double`], used when writing values back to the
/// target.
pub fn double_to_raw(ty: VarType, value: f64) -> u32 {
    match ty {
        VarType::U8 => (value as u8) as u32,
        VarType::I8 => (value as i8) as u8 as u32,
        VarType::U16 => (value as u16) as u32,
        VarType::I16 => (value as i16) as u16 as u32,
        VarType::U32 | VarType::Unknown => value as u32,
        VarType::I32 => (value as i32) as u32,
        VarType::F32 => (value as f32).to_bits(),
        VarType::Bool => (value != 0.0) as u32,
    }
}

/// Bit-field extraction from another variable's raw bytes. The base is
/// referenced by name and resolved through the owning
/// [`VariableHandler`]; holding a name instead of a pointer avoids
/// ownership cycles.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Fraction {
    pub base: String,
    pub mask: u32,
    pub shift: u8,
}

/// One observable target symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    name: String,
    /// Fully-qualified expression used when talking to the debugger,
    /// e.g. `moduleA.state.counter`.
    tracked_name: String,
    address: u32,
    var_type: VarType,
    color: u32,
    is_found: bool,
    should_update_from_elf: bool,
    raw: u32,
    fraction: Option<Fraction>,
}

impl Variable {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Variable {
            tracked_name: name.clone(),
            name,
            address: 0,
            var_type: VarType::Unknown,
            color: 0xffff_ffff,
            is_found: false,
            should_update_from_elf: true,
            raw: 0,
            fraction: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn tracked_name(&self) -> &str {
        &self.tracked_name
    }

    pub fn set_tracked_name(&mut self, name: impl Into<String>) {
        self.tracked_name = name.into();
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn set_address(&mut self, address: u32) {
        self.address = address;
    }

    pub fn is_address_valid(&self) -> bool {
        self.address >= MIN_ADDRESS
    }

    pub fn var_type(&self) -> VarType {
        self.var_type
    }

    pub fn set_var_type(&mut self, ty: VarType) {
        self.var_type = ty;
    }

    pub fn size(&self) -> u8 {
        self.var_type.size()
    }

    pub fn color(&self) -> u32 {
        self.color
    }

    pub fn set_color(&mut self, color: u32) {
        self.color = color;
    }

    pub fn is_found(&self) -> bool {
        self.is_found
    }

    pub fn set_is_found(&mut self, found: bool) {
        self.is_found = found;
    }

    pub fn should_update_from_elf(&self) -> bool {
        self.should_update_from_elf
    }

    pub fn set_should_update_from_elf(&mut self, update: bool) {
        self.should_update_from_elf = update;
    }

    pub fn raw_value(&self) -> u32 {
        self.raw
    }

    pub fn set_raw_value(&mut self, raw: u32) {
        self.raw = raw;
    }

    pub fn fraction(&self) -> Option<&Fraction> {
        self.fraction.as_ref()
    }

    pub fn set_fraction(&mut self, fraction: Option<Fraction>) {
        self.fraction = fraction;
    }

    pub fn raw_from_double(&self, value: f64) -> u32 {
        double_to_raw(self.var_type, value)
    }
}

/// Insertion-ordered set of [`Variable`]s shared between the GUI and the
/// worker thread. The GUI mutates the set only while acquisition is
/// stopped; the worker writes raw values each tick.
#[derive(Default)]
pub struct VariableHandler {
    vars: Mutex<Vec<Variable>>,
}

impl VariableHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `var`, replacing any existing variable of the same name.
    pub fn add(&self, var: Variable) {
        let mut vars = self.vars.lock().unwrap();
        match vars.iter_mut().find(|v| v.name == var.name) {
            Some(slot) => *slot = var,
            None => vars.push(var),
        }
    }

    pub fn remove(&self, name: &str) {
        self.vars.lock().unwrap().retain(|v| v.name != name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.lock().unwrap().iter().any(|v| v.name == name)
    }

    pub fn len(&self) -> usize {
        self.vars.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rename(&self, old: &str, new: &str) {
        let mut vars = self.vars.lock().unwrap();
        if let Some(var) = vars.iter_mut().find(|v| v.name == old) {
            var.name = new.to_string();
        }
    }

    /// Snapshot of one variable by name.
    pub fn get(&self, name: &str) -> Option<Variable> {
        self.vars
            .lock()
            .unwrap()
            .iter()
            .find(|v| v.name == name)
            .cloned()
    }

    /// Runs `f` with the variable list locked.
    pub fn with<R>(&self, f: impl FnOnce(&mut Vec<Variable>) -> R) -> R {
        f(&mut self.vars.lock().unwrap())
    }

    /// Stores freshly sampled raw values into the matching variables.
    pub fn apply_raw_values(&self, values: &HashMap<u32, u32>) {
        let mut vars = self.vars.lock().unwrap();
        for var in vars.iter_mut() {
            if let Some(&raw) = values.get(&var.address) {
                var.raw = raw;
            }
        }
    }

    /// Current plottable value of `name`, resolving an eventual
    /// fractional base through this handler.
    pub fn value_of(&self, name: &str) -> Option<f64> {
        let vars = self.vars.lock().unwrap();
        let var = vars.iter().find(|v| v.name == name)?;
        Some(value_in(&vars, var))
    }

    /// Addresses and sizes of all fractional-base variables, for
    /// extending the sample list.
    pub fn fraction_base_entries(&self) -> Vec<(u32, u8)> {
        let vars = self.vars.lock().unwrap();
        let mut entries = vec![];
        for var in vars.iter() {
            if let Some(fraction) = &var.fraction {
                if let Some(base) = vars.iter().find(|v| v.name == fraction.base) {
                    entries.push((base.address, base.size()));
                }
            }
        }
        entries
    }
}

/// Value of `var` given the full variable list, applying the fractional
/// extraction when one is configured.
pub(crate) fn value_in(vars: &[Variable], var: &Variable) -> f64 {
    let raw = match &var.fraction {
        Some(fraction) => {
            let base_raw = vars
                .iter()
                .find(|v| v.name == fraction.base)
                .map(|v| v.raw)
                .unwrap_or(0);
            (base_raw & fraction.mask) >> fraction.shift
        }
        None => var.raw,
    };
    raw_to_double(var.var_type, raw)
}
