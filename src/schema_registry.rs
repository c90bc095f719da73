use async_trait::async_trait;

use crate::{RegistryError, Subgraph};

#[async_trait]
pub trait SchemaRegistry {
    async fn register_service(&mut self, subgraph: Subgraph) -> Result<(), RegistryError>;

    /// Registered subgraphs, in registration order.
    async fn get_all(&self) -> Vec<Subgraph>;

    /// Freezes the registry; called when composition begins.
    async fn seal(&mut self);
}

#[derive(Default)]
pub struct InMemorySchemaRegistry {
    subgraphs: Vec<Subgraph>,
    sealed: bool,
}

impl InMemorySchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.subgraphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subgraphs.is_empty()
    }
}

#[async_trait]
impl SchemaRegistry for InMemorySchemaRegistry {
    async fn register_service(&mut self, subgraph: Subgraph) -> Result<(), RegistryError> {
        if self.sealed {
            return Err(RegistryError::Sealed(subgraph.name().to_string()));
        }
        if self.subgraphs.iter().any(|s| s.name() == subgraph.name()) {
            return Err(RegistryError::DuplicateName(subgraph.name().to_string()));
        }

        tracing::debug!(subgraph = subgraph.name(), url = subgraph.url(), "registered subgraph");
        self.subgraphs.push(subgraph);
        Ok(())
    }

    async fn get_all(&self) -> Vec<Subgraph> {
        self.subgraphs.clone()
    }

    async fn seal(&mut self) {
        self.sealed = true;
    }
}
