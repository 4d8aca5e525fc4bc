use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use itertools::Itertools;
use thiserror::Error;

use super::{
    desc::{Desc, DescError, Dims},
    engine::Engine,
    layout::Format,
    num::DataType,
};

#[derive(Debug, Error)]
pub enum TensorError {
    #[error("tensor creation error: descriptor {0} has no concrete layout")]
    Undefined(Desc),
    #[error("tensor creation error: descriptor {0}'s size not match data len {1}")]
    Create(Desc, usize),
    #[error("tensor creation error: {0} bytes is not a whole number of {1} elements")]
    Bytes(usize, DataType),
    #[error(transparent)]
    Desc(#[from] DescError),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorId;

/// Shared handle to a tensor. One tensor may feed several consumer nodes.
pub type TensorRef = Arc<Tensor>;

/// A descriptor plus the contiguous buffer it describes.
///
/// The buffer always holds exactly [`Desc::size`] elements, which includes the zero lanes a
/// channel-blocked layout pads with.
pub struct Tensor {
    engine: Engine,
    desc: Desc,
    id: uid::Id<TensorId>,
    data: RwLock<Box<[f32]>>,
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("engine", &self.engine)
            .field("desc", &self.desc)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Tensor {
    fn check_desc(desc: &Desc) -> Result<(), TensorError> {
        match desc.is_undef() || !desc.format().is_defined() {
            true => Err(TensorError::Undefined(desc.clone())),
            false => Ok(()),
        }
    }

    /// Create a tensor of zeros.
    pub fn zeros(engine: &Engine, desc: Desc) -> Result<Self, TensorError> {
        Self::check_desc(&desc)?;
        let data = vec![0.0; desc.size()].into_boxed_slice();
        Ok(Self::from_parts(engine, desc, data))
    }

    /// Create a tensor with the given raw buffer contents, already in the layout of `desc`.
    pub fn create(
        engine: &Engine,
        desc: Desc,
        contents: impl Into<Box<[f32]>>,
    ) -> Result<Self, TensorError> {
        Self::check_desc(&desc)?;
        let data: Box<[f32]> = contents.into();
        if data.len() != desc.size() {
            return Err(TensorError::Create(desc, data.len()));
        }
        Ok(Self::from_parts(engine, desc, data))
    }

    /// Create a tensor from native-endian element bytes, e.g. a weight blob.
    pub fn from_bytes(engine: &Engine, desc: Desc, bytes: &[u8]) -> Result<Self, TensorError> {
        let size = desc.data_type().size();
        if size == 0 || bytes.len() % size != 0 {
            return Err(TensorError::Bytes(bytes.len(), desc.data_type()));
        }
        let contents: Vec<f32> = bytemuck::pod_collect_to_vec(bytes);
        Self::create(engine, desc, contents)
    }

    fn from_parts(engine: &Engine, desc: Desc, data: Box<[f32]>) -> Self {
        Self {
            engine: *engine,
            desc,
            id: uid::Id::new(),
            data: RwLock::new(data),
        }
    }

    #[inline]
    pub fn into_ref(self) -> TensorRef {
        Arc::new(self)
    }

    #[inline]
    pub fn engine(&self) -> Engine {
        self.engine
    }

    #[inline]
    pub fn desc(&self) -> &Desc {
        &self.desc
    }

    #[inline]
    pub fn dims(&self) -> &Dims {
        self.desc.dims()
    }

    #[inline]
    pub fn format(&self) -> Format {
        self.desc.format()
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.desc.data_type()
    }

    #[inline]
    pub fn id(&self) -> uid::Id<TensorId> {
        self.id
    }

    /// Number of elements in the buffer, padding included.
    #[inline]
    pub fn data_count(&self) -> usize {
        self.desc.size()
    }

    #[inline]
    pub fn data_size(&self) -> usize {
        self.desc.data_size()
    }

    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, Box<[f32]>> {
        self.data.read().expect("failed to lock")
    }

    #[inline]
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[f32]>> {
        self.data.write().expect("failed to lock")
    }

    /// Reads the element at a logical coordinate.
    ///
    /// # Panics
    /// Panics if `index` is out of bounds.
    #[inline]
    pub fn get(&self, index: &[usize]) -> f32 {
        self.read()[self.desc.offset(index)]
    }

    /// Writes the element at a logical coordinate.
    ///
    /// # Panics
    /// Panics if `index` is out of bounds.
    #[inline]
    pub fn set(&self, index: &[usize], value: f32) {
        let offset = self.desc.offset(index);
        self.write()[offset] = value;
    }

    /// Writes `f(index)` at every logical coordinate. Padding lanes are left untouched.
    ///
    /// The write lock is held while `f` runs, so `f` must not access this tensor.
    pub fn fill(&self, mut f: impl FnMut(&[usize]) -> f32) {
        let mut data = self.write();
        for index in self.dims().iter().map(|&d| 0..d).multi_cartesian_product() {
            data[self.desc.offset(&index)] = f(&index);
        }
    }

    /// Copies the raw buffer out, padding included.
    #[inline]
    pub fn to_vec(&self) -> Vec<f32> {
        self.read().to_vec()
    }
}
