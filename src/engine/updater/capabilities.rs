//! Capability set resolved once at startup and injected into the
//! checker and installer.

use std::sync::Arc;

use super::extract::{ArchiveExtractor, NoExtractor, TarGzExtractor, ZipExtractor};
use super::verify::{RingRsaBackend, SignatureBackend};
use crate::engine::config::{ExtractorKind, UpdaterConfig};

#[derive(Clone)]
pub struct Capabilities {
    pub extractor: Arc<dyn ArchiveExtractor>,
    pub signatures: Arc<dyn SignatureBackend>,
}

impl Capabilities {
    pub fn new(extractor: Arc<dyn ArchiveExtractor>, signatures: Arc<dyn SignatureBackend>) -> Self {
        Self {
            extractor,
            signatures,
        }
    }

    pub fn from_config(config: &UpdaterConfig) -> Self {
        let extractor: Arc<dyn ArchiveExtractor> = match config.extractor {
            ExtractorKind::Zip => Arc::new(ZipExtractor),
            ExtractorKind::TarGz => Arc::new(TarGzExtractor),
            ExtractorKind::None => Arc::new(NoExtractor),
        };
        let capabilities = Self::new(extractor, Arc::new(RingRsaBackend));
        tracing::debug!(
            "Capabilities: extractor={}, signatures={}",
            capabilities.extractor.name(),
            capabilities.signatures.name()
        );
        capabilities
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::new(Arc::new(ZipExtractor), Arc::new(RingRsaBackend))
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("extractor", &self.extractor.name())
            .field("signatures", &self.signatures.name())
            .finish()
    }
}
