use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum EngineKind {
    /// An unspecified engine.
    #[default]
    #[display("any")]
    Any,
    #[display("cpu")]
    Cpu,
}

/// Backend handle threaded through tensor creation.
///
/// On the CPU the engine carries no state: kernels always run on the host, and the handle only
/// records where a tensor was created.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("{kind}:{index}")]
pub struct Engine {
    kind: EngineKind,
    index: usize,
}

impl Engine {
    #[inline]
    pub const fn new(kind: EngineKind, index: usize) -> Self {
        Self { kind, index }
    }

    #[inline]
    pub const fn cpu() -> Self {
        Self::new(EngineKind::Cpu, 0)
    }

    #[inline]
    pub const fn kind(&self) -> EngineKind {
        self.kind
    }

    #[inline]
    pub const fn index(&self) -> usize {
        self.index
    }
}
