//! Plain-data shader reflection, as produced by a [`ShaderCompiler`].

use {
    ash::vk,
    std::{error::Error, sync::Arc},
};

/// Compiles one shader file for one stage.
///
/// Implementations may block; they are called from [`super::Configurator::rebuild`].
pub trait ShaderCompiler: Send + Sync {
    fn compile(
        &self,
        file: &str,
        stage: vk::ShaderStageFlags,
        defines: &[(String, String)],
    ) -> Result<CompiledShader, Box<dyn Error + Send + Sync>>;
}

#[derive(Clone, Debug)]
pub struct CompiledShader {
    pub spirv: Arc<[u32]>,
    pub reflection: ShaderReflection,
}

/// The descriptor bindings used by one compiled shader.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ShaderReflection {
    pub bindings: Vec<BindingReflection>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BindingReflection {
    pub set: u32,
    pub binding: u32,
    pub name: String,
    pub ty: vk::DescriptorType,
    pub count: DescriptorCount,

    /// `true` for storage resources not decorated `readonly`.
    pub writable: bool,

    /// The layout of uniform and storage buffer blocks.
    pub block: Option<StructType>,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum DescriptorCount {
    Single,
    Array(u32),

    /// A runtime-sized descriptor array.
    Unsized,
}

impl DescriptorCount {
    pub fn len(self) -> Option<u32> {
        match self {
            Self::Single => Some(1),
            Self::Array(len) => Some(len),
            Self::Unsized => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ScalarKind {
    Bool,
    Int,
    Uint,
    Float,
    Double,
}

impl ScalarKind {
    pub fn size(self) -> u32 {
        match self {
            Self::Double => 8,
            _ => 4,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StructType {
    pub size: u32,
    pub members: Vec<StructMember>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StructMember {
    pub name: String,

    /// Byte offset within the enclosing struct.
    pub offset: u32,
    pub ty: ReflectedType,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ReflectedType {
    Scalar(ScalarKind),
    Vector {
        kind: ScalarKind,
        len: u32,
    },
    Matrix {
        kind: ScalarKind,
        columns: u32,
        rows: u32,

        /// Byte distance between columns.
        stride: u32,
    },
    Array {
        element: Box<ReflectedType>,

        /// `None` for runtime-sized arrays.
        len: Option<u32>,
        stride: u32,
    },
    Struct(StructType),
}

impl ReflectedType {
    /// The size in bytes, or `None` if runtime-sized.
    pub fn size(&self) -> Option<u32> {
        Some(match self {
            Self::Scalar(kind) => kind.size(),
            Self::Vector { kind, len } => kind.size() * len,
            Self::Matrix {
                kind,
                columns,
                rows,
                stride,
            } => stride * (columns - 1) + kind.size() * rows,
            Self::Array { len, stride, .. } => len.map(|len| len * stride)?,
            Self::Struct(ty) => ty.size,
        })
    }

    pub fn array(element: Self, len: u32, stride: u32) -> Self {
        Self::Array {
            element: Box::new(element),
            len: Some(len),
            stride,
        }
    }

    pub fn vec(len: u32) -> Self {
        Self::Vector {
            kind: ScalarKind::Float,
            len,
        }
    }

    /// A column-major `f32` matrix with std140 column alignment.
    pub fn mat(columns: u32, rows: u32) -> Self {
        Self::Matrix {
            kind: ScalarKind::Float,
            columns,
            rows,
            stride: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn reflected_type_size() {
        assert_eq!(ReflectedType::Scalar(ScalarKind::Double).size(), Some(8));
        assert_eq!(ReflectedType::vec(3).size(), Some(12));
        assert_eq!(ReflectedType::mat(4, 4).size(), Some(64));
        assert_eq!(ReflectedType::mat(3, 3).size(), Some(44));
        assert_eq!(
            ReflectedType::array(ReflectedType::vec(2), 4, 16).size(),
            Some(64)
        );
        assert_eq!(
            ReflectedType::Array {
                element: Box::new(ReflectedType::vec(4)),
                len: None,
                stride: 16,
            }
            .size(),
            None
        );
    }

    #[test]
    pub fn descriptor_count_len() {
        assert_eq!(DescriptorCount::Single.len(), Some(1));
        assert_eq!(DescriptorCount::Array(8).len(), Some(8));
        assert_eq!(DescriptorCount::Unsized.len(), None);
    }
}
