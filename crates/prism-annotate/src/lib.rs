//! Shader output annotation: bytecode rewrites that recover intermediate
//! pipeline data from an already-compiled pipeline during replay.
//!
//! Three transforms share the editing machinery from `prism-spirv`:
//! - [`postvs`]: rewrites a vertex shader into a compute shader that pulls
//!   attributes from compacted raw buffers, runs the original entry point,
//!   and stores every output into a packed record.
//! - [`meshout`]: patches task/mesh shaders for two-pass count-then-commit
//!   output capture.
//! - [`feedback`]: instruments descriptor-array accesses and debug-printf
//!   calls with atomically reserved feedback writes.
//!
//! All transforms are strategy-agnostic with respect to buffer addressing:
//! the [`strategy::PointerStrategy`] selected once per fetch decides whether
//! buffers are reached through 64-bit device addresses (KHR or EXT flavor)
//! or through a reserved, shifted descriptor binding.

pub mod attr;
pub mod emit;
pub mod feedback;
pub mod meshout;
pub mod postvs;
pub mod reflect;
pub mod strategy;

use prism_spirv::ExecutionModel;
use thiserror::Error;

/// Pipeline stage of a shader being annotated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    TessControl,
    TessEval,
    Geometry,
    Fragment,
    Compute,
    Task,
    Mesh,
}

impl ShaderStage {
    pub fn from_execution_model(model: ExecutionModel) -> ShaderStage {
        match model {
            ExecutionModel::Vertex => ShaderStage::Vertex,
            ExecutionModel::TessellationControl => ShaderStage::TessControl,
            ExecutionModel::TessellationEvaluation => ShaderStage::TessEval,
            ExecutionModel::Geometry => ShaderStage::Geometry,
            ExecutionModel::Fragment => ShaderStage::Fragment,
            ExecutionModel::GLCompute => ShaderStage::Compute,
            ExecutionModel::TaskEXT => ShaderStage::Task,
            ExecutionModel::MeshEXT => ShaderStage::Mesh,
        }
    }

    /// Stable index used in feedback headers and printf location words.
    pub fn index(self) -> u32 {
        match self {
            ShaderStage::Vertex => 0,
            ShaderStage::TessControl => 1,
            ShaderStage::TessEval => 2,
            ShaderStage::Geometry => 3,
            ShaderStage::Fragment => 4,
            ShaderStage::Compute => 5,
            ShaderStage::Task => 6,
            ShaderStage::Mesh => 7,
        }
    }
}

/// Errors from the annotation passes.
///
/// These are internal-consistency failures (the bound pipeline's module is
/// assumed well-formed); the executor logs them loudly and excludes the event
/// from fetch operations rather than aborting the session.
#[derive(Debug, Error)]
pub enum AnnotateError {
    #[error(transparent)]
    Spirv(#[from] prism_spirv::SpirvError),
    #[error("entry point \"{0}\" not found")]
    MissingEntryPoint(String),
    #[error("entry point \"{name}\" is a {found:?} shader, expected {expected:?}")]
    WrongStage {
        name: String,
        found: ShaderStage,
        expected: ShaderStage,
    },
    #[error("vertex input at location {location} has no attribute description")]
    MissingAttribute { location: u32 },
    #[error("unsupported input type for location {location}: {context}")]
    UnsupportedInputType {
        location: u32,
        context: &'static str,
    },
    #[error("unsupported output type: {context}")]
    UnsupportedOutputType { context: &'static str },
    #[error("mesh shader declares no {0} instruction")]
    MissingMeshInstruction(&'static str),
}
