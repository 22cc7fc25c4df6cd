//! MIR Module
//!
//! A MIR module contains all the functions, type definitions and witness
//! tables for a compilation unit, together with the differential-witness
//! cache that lives exactly as long as the module does.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::ad::witness::WitnessCache;
use super::function::*;
use super::types::*;

/// A MIR module (compilation unit)
#[derive(Clone, Debug)]
pub struct MirModule {
    /// Module name
    pub name: String,
    /// Functions
    pub functions: Vec<MirFunction>,
    /// Type definitions
    pub types: Vec<TypeDef>,
    /// Interface witness tables
    pub witness_tables: Vec<WitnessTable>,
    /// Differential witnesses synthesized for this module's types
    pub witness_cache: Arc<WitnessCache>,
}

impl MirModule {
    /// Create a new module
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            functions: Vec::new(),
            types: Vec::new(),
            witness_tables: Vec::new(),
            witness_cache: Arc::new(WitnessCache::new()),
        }
    }

    /// Add a function
    pub fn add_function(&mut self, func: MirFunction) {
        self.functions.push(func);
    }

    /// Add a type definition
    pub fn add_type(&mut self, type_def: TypeDef) {
        self.types.push(type_def);
    }

    /// Add a witness table
    pub fn add_witness_table(&mut self, table: WitnessTable) {
        self.witness_tables.push(table);
    }

    /// Get a function by name
    pub fn get_function(&self, name: &str) -> Option<&MirFunction> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Get a function mutably by name
    pub fn get_function_mut(&mut self, name: &str) -> Option<&mut MirFunction> {
        self.functions.iter_mut().find(|f| f.name == name)
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.get_function(name).is_some()
    }

    /// Get a type by name
    pub fn get_type(&self, name: &str) -> Option<&TypeDef> {
        self.types.iter().find(|t| t.name == name)
    }

    /// Declared differentiable conformance of a named struct type
    pub fn conformance_for(&self, ty: &MirType) -> Option<&DiffConformance> {
        match ty {
            MirType::Struct { name, .. } => {
                self.get_type(name).and_then(|t| t.conformance.as_ref())
            }
            _ => None,
        }
    }

    /// Get a witness table by name
    pub fn get_witness_table(&self, name: &str) -> Option<&WitnessTable> {
        self.witness_tables.iter().find(|t| t.name == name)
    }

    pub fn get_witness_table_mut(&mut self, name: &str) -> Option<&mut WitnessTable> {
        self.witness_tables.iter_mut().find(|t| t.name == name)
    }

    /// Every table for an interface, in declaration order
    pub fn tables_for_interface<'a>(
        &'a self,
        interface: &'a str,
    ) -> impl Iterator<Item = &'a WitnessTable> + 'a {
        self.witness_tables
            .iter()
            .filter(move |t| t.interface == interface)
    }

    /// Number of functions
    pub fn num_functions(&self) -> usize {
        self.functions.len()
    }

    /// Get all function names
    pub fn function_names(&self) -> Vec<&str> {
        self.functions.iter().map(|f| f.name.as_str()).collect()
    }

    /// Validate the entire module
    pub fn validate(&self) -> Result<(), Vec<(String, ValidationError)>> {
        let errors: Vec<_> = self
            .functions
            .iter()
            .filter(|f| !f.is_declaration())
            .filter_map(|f| f.validate().err().map(|e| (f.name.clone(), e)))
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Type definition
#[derive(Clone, Debug)]
pub struct TypeDef {
    /// Name
    pub name: String,
    /// The type
    pub ty: MirType,
    /// Explicit differentiable conformance, if declared
    pub conformance: Option<DiffConformance>,
}

impl TypeDef {
    pub fn new(name: &str, ty: MirType) -> Self {
        Self {
            name: name.to_string(),
            ty,
            conformance: None,
        }
    }

    pub fn with_conformance(mut self, conformance: DiffConformance) -> Self {
        self.conformance = Some(conformance);
        self
    }
}

/// User-declared differential type and its operations
#[derive(Clone, Debug, PartialEq)]
pub struct DiffConformance {
    /// The nominated differential type
    pub differential: MirType,
    /// `() -> Differential`
    pub zero_fn: String,
    /// `(Differential, Differential) -> Differential`
    pub add_fn: String,
}

/// Interface conformance table: requirement name to implementing function
#[derive(Clone, Debug, PartialEq)]
pub struct WitnessTable {
    pub name: String,
    pub interface: String,
    pub entries: BTreeMap<String, String>,
}

impl WitnessTable {
    pub fn new(name: &str, interface: &str) -> Self {
        Self {
            name: name.to_string(),
            interface: interface.to_string(),
            entries: BTreeMap::new(),
        }
    }

    pub fn with_entry(mut self, requirement: &str, function: &str) -> Self {
        self.entries
            .insert(requirement.to_string(), function.to_string());
        self
    }

    pub fn lookup(&self, requirement: &str) -> Option<&str> {
        self.entries.get(requirement).map(|s| s.as_str())
    }
}

/// Builder for constructing MIR modules
pub struct ModuleBuilder {
    module: MirModule,
}

impl ModuleBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            module: MirModule::new(name),
        }
    }

    /// Add a function using a builder
    pub fn function(
        &mut self,
        name: &str,
        signature: FunctionSignature,
        build_fn: impl FnOnce(&mut FunctionBuilder),
    ) -> &mut Self {
        let mut builder = FunctionBuilder::new(name, signature);
        build_fn(&mut builder);
        self.module.add_function(builder.build());
        self
    }

    /// Add a function marked differentiable
    pub fn differentiable(
        &mut self,
        name: &str,
        mode: DiffMode,
        signature: FunctionSignature,
        build_fn: impl FnOnce(&mut FunctionBuilder),
    ) -> &mut Self {
        let mut builder = FunctionBuilder::new(name, signature);
        builder.attributes_mut().differentiable = Some(mode);
        build_fn(&mut builder);
        self.module.add_function(builder.build());
        self
    }

    /// Add a type definition
    pub fn type_def(&mut self, name: &str, ty: MirType) -> &mut Self {
        self.module.add_type(TypeDef::new(name, ty));
        self
    }

    /// Add a type with a declared differential conformance
    pub fn conforming_type(
        &mut self,
        name: &str,
        ty: MirType,
        conformance: DiffConformance,
    ) -> &mut Self {
        self.module
            .add_type(TypeDef::new(name, ty).with_conformance(conformance));
        self
    }

    /// Add a witness table
    pub fn witness_table(&mut self, table: WitnessTable) -> &mut Self {
        self.module.add_witness_table(table);
        self
    }

    pub fn build(self) -> MirModule {
        self.module
    }
}
