use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{ConfigMode, EngineConfig, TransportConfig};
use crate::core::index::Attribute;
use crate::transform::TransformRegistry;
use crate::types::{to_bytes, Dims, ElementType, Params, LOCAL_VALUE_DIM};
use crate::{Element, Error, Result, Variable};

/// Definitions shared by the engines opened on one logical stream: parameters,
/// transports, variables and attributes.
#[derive(Debug)]
pub struct Io {
    name: String,
    params: Params,
    config_mode: ConfigMode,
    transports: Vec<Params>,
    host_language: String,
    registry: Arc<TransformRegistry>,
    variables: BTreeMap<String, Variable>,
    attributes: Vec<Attribute>,
}

impl Io {
    /// A context whose registry holds the built-in compression transforms.
    pub fn new(name: &str) -> Io {
        Io::with_registry(name, Arc::new(TransformRegistry::with_builtins()))
    }

    pub fn with_registry(name: &str, registry: Arc<TransformRegistry>) -> Io {
        Io {
            name: name.to_string(),
            params: Params::new(),
            config_mode: ConfigMode::default(),
            transports: Vec::new(),
            host_language: "Rust".to_string(),
            registry,
            variables: BTreeMap::new(),
            attributes: Vec::new(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn registry(&self) -> &Arc<TransformRegistry> {
        &self.registry
    }

    #[inline]
    pub fn host_language(&self) -> &str {
        &self.host_language
    }

    pub fn set_host_language(&mut self, language: &str) {
        self.host_language = language.to_string();
    }

    pub fn set_parameter(&mut self, key: &str, value: &str) {
        self.params.insert(key.to_string(), value.to_string());
    }

    pub fn set_parameters(&mut self, params: Params) {
        self.params.extend(params);
    }

    #[inline]
    pub fn parameters(&self) -> &Params {
        &self.params
    }

    pub fn set_config_mode(&mut self, mode: ConfigMode) {
        self.config_mode = mode;
    }

    /// Adds a transport of `kind` (`file` or `shm`) and returns its index.
    pub fn add_transport(&mut self, kind: &str, mut params: Params) -> usize {
        params.insert("transport".to_string(), kind.to_string());
        self.transports.push(params);
        self.transports.len() - 1
    }

    pub fn engine_config(&self) -> Result<EngineConfig> {
        EngineConfig::from_params(&self.params, self.config_mode)
    }

    /// One config per added transport, or a single file transport when none was added.
    pub fn transport_configs(&self) -> Result<Vec<TransportConfig>> {
        if self.transports.is_empty() {
            return Ok(vec![TransportConfig::file()]);
        }
        self.transports
            .iter()
            .map(|params| TransportConfig::from_params(params, self.config_mode))
            .collect()
    }

    fn insert_variable(&mut self, variable: Variable) -> Result<&mut Variable> {
        if self.variables.contains_key(variable.name()) {
            return Err(Error::InvalidArgument(format!(
                "variable {} already defined in IO {}",
                variable.name(),
                self.name
            )));
        }
        let name = variable.name().to_string();
        Ok(self.variables.entry(name).or_insert(variable))
    }

    /// Defines an array or value. Empty `shape`, `start` and `count` make a global
    /// value; only `count` makes a local array.
    pub fn define_variable<T: Element>(
        &mut self,
        name: &str,
        shape: Dims,
        start: Dims,
        count: Dims,
        constant_dims: bool,
    ) -> Result<&mut Variable> {
        let variable = Variable::new(name, T::TYPE, shape, start, count, constant_dims)?;
        self.insert_variable(variable)
    }

    /// Defines a variable of a fixed-size user struct, transferred as opaque bytes.
    pub fn define_compound_variable(
        &mut self,
        name: &str,
        element_size: u32,
        shape: Dims,
        start: Dims,
        count: Dims,
        constant_dims: bool,
    ) -> Result<&mut Variable> {
        if element_size == 0 {
            return Err(Error::InvalidArgument(format!(
                "compound variable {} has zero-sized elements",
                name
            )));
        }
        let variable = Variable::new(
            name,
            ElementType::Compound(element_size),
            shape,
            start,
            count,
            constant_dims,
        )?;
        self.insert_variable(variable)
    }

    /// Defines a value each rank writes independently.
    pub fn define_local_value<T: Element>(&mut self, name: &str) -> Result<&mut Variable> {
        self.define_variable::<T>(name, vec![LOCAL_VALUE_DIM], vec![], vec![], true)
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }

    pub fn variable_mut(&mut self, name: &str) -> Option<&mut Variable> {
        self.variables.get_mut(name)
    }

    pub fn remove_variable(&mut self, name: &str) -> bool {
        self.variables.remove(name).is_some()
    }

    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.variables.values()
    }

    pub fn define_attribute<T: Element>(&mut self, name: &str, values: &[T]) -> Result<&Attribute> {
        self.push_attribute(Attribute {
            name: name.to_string(),
            element_type: T::TYPE,
            data: to_bytes(values),
        })
    }

    pub fn define_string_attribute(&mut self, name: &str, value: &str) -> Result<&Attribute> {
        self.push_attribute(Attribute {
            name: name.to_string(),
            element_type: ElementType::Char,
            data: value.as_bytes().to_vec(),
        })
    }

    fn push_attribute(&mut self, attribute: Attribute) -> Result<&Attribute> {
        if self.attribute(&attribute.name).is_some() {
            return Err(Error::InvalidArgument(format!(
                "attribute {} already defined in IO {}",
                attribute.name, self.name
            )));
        }
        self.attributes.push(attribute);
        self.attributes
            .last()
            .ok_or_else(|| Error::InvalidState("attribute vanished".into()))
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    #[inline]
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ShapeKind;

    #[test]
    fn one_variable_per_name() {
        let mut io = Io::new("sim");
        io.define_variable::<f32>("T", vec![4, 4], vec![0, 0], vec![4, 4], false)
            .unwrap();
        assert!(matches!(
            io.define_variable::<f64>("T", vec![], vec![], vec![], false),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(io.variable("T").unwrap().element_type(), ElementType::Float32);

        assert!(io.remove_variable("T"));
        assert!(!io.remove_variable("T"));
        io.define_variable::<f64>("T", vec![], vec![], vec![], false)
            .unwrap();
    }

    #[test]
    fn local_and_compound() {
        let mut io = Io::new("sim");
        let v = io.define_local_value::<i32>("rank").unwrap();
        assert_eq!(v.shape_kind(), ShapeKind::LocalValue);

        let c = io
            .define_compound_variable("particles", 24, vec![], vec![], vec![10], false)
            .unwrap();
        assert_eq!(c.payload_size(), 240);
        assert!(io
            .define_compound_variable("empty", 0, vec![], vec![], vec![1], false)
            .is_err());
    }

    #[test]
    fn attributes() {
        let mut io = Io::new("sim");
        io.define_attribute("dt", &[0.5f64]).unwrap();
        io.define_string_attribute("units", "K").unwrap();
        assert!(io.define_attribute("dt", &[1.0f64]).is_err());
        assert_eq!(io.attribute("dt").unwrap().values::<f64>(), Some(vec![0.5]));
        assert_eq!(io.attribute("units").unwrap().data, b"K");
    }

    #[test]
    fn transports_default_to_file() {
        let mut io = Io::new("sim");
        assert_eq!(io.transport_configs().unwrap(), vec![TransportConfig::file()]);

        let mut params = Params::new();
        params.insert("capacity".into(), "4Kb".into());
        assert_eq!(io.add_transport("shm", params), 0);
        let configs = io.transport_configs().unwrap();
        assert_eq!(configs[0].capacity, Some(4096));

        io.set_parameter("Verbose", "9");
        assert!(io.engine_config().is_err());
    }
}
