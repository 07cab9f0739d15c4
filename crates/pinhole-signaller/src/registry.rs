//! In-memory producer and file registries.
//!
//! Both live for the signaller's process lifetime and hand out clones, so
//! callers can never mutate registry state through a retained reference.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use pinhole_types::models::{FileMeta, Producer, UdpOptions};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("producer not found")]
    ProducerNotFound,
    #[error("file not found")]
    FileNotFound,
}

#[derive(Default)]
pub struct ProducerRegistry {
    producers: RwLock<HashMap<Uuid, Producer>>,
}

impl ProducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registration always succeeds; the id is minted here.
    pub fn register(&self, udp_options: UdpOptions) -> Uuid {
        let producer = Producer::new(udp_options);
        let id = producer.id;
        self.producers.write().insert(id, producer);
        id
    }

    pub fn get(&self, id: Uuid) -> Result<Producer, RegistryError> {
        self.producers
            .read()
            .get(&id)
            .cloned()
            .ok_or(RegistryError::ProducerNotFound)
    }

    /// Atomically replace a producer's endpoint. Called from the transfer
    /// coordinator with the freshly re-measured address a producer returns
    /// on accept.
    pub fn update_udp_options(
        &self,
        id: Uuid,
        udp_options: UdpOptions,
    ) -> Result<(), RegistryError> {
        match self.producers.write().get_mut(&id) {
            Some(producer) => {
                producer.udp_options = udp_options;
                Ok(())
            }
            None => Err(RegistryError::ProducerNotFound),
        }
    }
}

pub struct FileRegistry {
    files: RwLock<HashMap<Uuid, FileMeta>>,
    producers: Arc<ProducerRegistry>,
}

impl FileRegistry {
    pub fn new(producers: Arc<ProducerRegistry>) -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
            producers,
        }
    }

    /// Register a file for an existing producer.
    pub fn register(
        &self,
        name: String,
        size: u64,
        hash: Vec<u8>,
        producer_id: Uuid,
    ) -> Result<Uuid, RegistryError> {
        self.producers.get(producer_id)?;

        let meta = FileMeta::new(name, size, hash, producer_id);
        let id = meta.id;
        self.files.write().insert(id, meta);
        Ok(id)
    }

    pub fn get_file_meta(&self, id: Uuid) -> Result<FileMeta, RegistryError> {
        self.files
            .read()
            .get(&id)
            .cloned()
            .ok_or(RegistryError::FileNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(port: u16) -> UdpOptions {
        UdpOptions {
            external_ip: "198.51.100.7".into(),
            external_port: port,
        }
    }

    #[test]
    fn register_and_get_producer() {
        let registry = ProducerRegistry::new();
        let id = registry.register(opts(40001));

        let producer = registry.get(id).unwrap();
        assert_eq!(producer.id, id);
        assert_eq!(producer.udp_options, opts(40001));

        assert_eq!(
            registry.get(Uuid::new_v4()),
            Err(RegistryError::ProducerNotFound)
        );
    }

    #[test]
    fn update_udp_options_replaces_endpoint() {
        let registry = ProducerRegistry::new();
        let id = registry.register(opts(40001));

        registry.update_udp_options(id, opts(40500)).unwrap();
        assert_eq!(registry.get(id).unwrap().udp_options.external_port, 40500);

        assert_eq!(
            registry.update_udp_options(Uuid::new_v4(), opts(1)),
            Err(RegistryError::ProducerNotFound)
        );
    }

    #[test]
    fn returned_producer_is_a_clone() {
        let registry = ProducerRegistry::new();
        let id = registry.register(opts(40001));

        let mut copy = registry.get(id).unwrap();
        copy.udp_options.external_port = 9;
        assert_eq!(registry.get(id).unwrap().udp_options.external_port, 40001);
    }

    #[test]
    fn file_registration_requires_existing_producer() {
        let producers = Arc::new(ProducerRegistry::new());
        let files = FileRegistry::new(producers.clone());

        assert_eq!(
            files.register("a.bin".into(), 4096, Vec::new(), Uuid::new_v4()),
            Err(RegistryError::ProducerNotFound)
        );

        let producer_id = producers.register(opts(40001));
        let file_id = files
            .register("a.bin".into(), 4096, Vec::new(), producer_id)
            .unwrap();

        let meta = files.get_file_meta(file_id).unwrap();
        assert_eq!(meta.name, "a.bin");
        assert_eq!(meta.size, 4096);
        assert_eq!(meta.producer_id, producer_id);

        assert_eq!(
            files.get_file_meta(Uuid::new_v4()),
            Err(RegistryError::FileNotFound)
        );
    }
}
