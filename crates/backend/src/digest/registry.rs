use std::{collections::HashMap, sync::Arc};

use thiserror::Error;

use crate::digest::Digester;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
  #[error("Output {output} is declared by both {first} and {second}")]
  DuplicateOutput {
    output: String,
    first: String,
    second: String,
  },
  #[error("Digester {0} declares no outputs")]
  NoOutputs(String),
}

/// Ordered, immutable list of digesters.
///
/// Order is dependency order: a digester may read records written by any
/// digester registered before it in the same pass.
#[derive(Clone)]
pub struct DigesterRegistry {
  digesters: Vec<Arc<dyn Digester>>,
  /// Output name -> position in registry output order
  output_order: HashMap<String, usize>,
}

impl DigesterRegistry {
  pub fn builder() -> RegistryBuilder {
    RegistryBuilder::default()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Digester>> {
    self.digesters.iter()
  }

  pub fn len(&self) -> usize {
    self.digesters.len()
  }

  pub fn is_empty(&self) -> bool {
    self.digesters.is_empty()
  }

  pub fn get(&self, name: &str) -> Option<&Arc<dyn Digester>> {
    self.digesters.iter().find(|d| d.name() == name)
  }

  /// Digester that declares `output`
  pub fn owner_of(&self, output: &str) -> Option<&Arc<dyn Digester>> {
    self
      .digesters
      .iter()
      .find(|d| d.output_names().iter().any(|n| n == output))
  }

  /// Position of an output name in registry order
  pub fn output_position(&self, output: &str) -> Option<usize> {
    self.output_order.get(output).copied()
  }

  /// Every output name, in registry order
  pub fn output_names(&self) -> Vec<String> {
    self.digesters.iter().flat_map(|d| d.output_names()).collect()
  }
}

impl std::fmt::Debug for DigesterRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_list().entries(self.digesters.iter().map(|d| d.name())).finish()
  }
}

#[derive(Default)]
pub struct RegistryBuilder {
  digesters: Vec<Arc<dyn Digester>>,
}

impl RegistryBuilder {
  pub fn register(self, digester: impl Digester + 'static) -> Self {
    self.register_arc(Arc::new(digester))
  }

  pub fn register_arc(mut self, digester: Arc<dyn Digester>) -> Self {
    self.digesters.push(digester);
    self
  }

  /// Freeze the registry, rejecting overlapping output names
  pub fn build(self) -> Result<DigesterRegistry, RegistryError> {
    let mut owners: HashMap<String, String> = HashMap::new();
    let mut output_order = HashMap::new();

    for digester in &self.digesters {
      let outputs = digester.output_names();
      if outputs.is_empty() {
        return Err(RegistryError::NoOutputs(digester.name().to_string()));
      }
      for output in outputs {
        if let Some(first) = owners.get(&output) {
          return Err(RegistryError::DuplicateOutput {
            output,
            first: first.clone(),
            second: digester.name().to_string(),
          });
        }
        owners.insert(output.clone(), digester.name().to_string());
        let position = output_order.len();
        output_order.insert(output, position);
      }
    }

    Ok(DigesterRegistry {
      digesters: self.digesters,
      output_order,
    })
  }
}
