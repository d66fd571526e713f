//! Culling configuration
//!
//! Limits are read once before the pipeline is created and sized into every
//! buffer. Toggles flow into the per-frame cull data.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::constants::{culling, flags, meshlet};
use crate::error::{CullError, CullResult};

/// Static capacity bounds handed to pipeline initialization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CullLimits {
    pub max_objects: u32,
    pub max_meshlets: u32,
    pub max_draw_indirect_calls: u32,
    pub meshlet_max_triangles: u32,
    pub buffered_frames: u32,
    pub batch_overlap: u32,
}

impl CullLimits {
    pub const DEFAULT: CullLimits = CullLimits {
        max_objects: culling::MAX_OBJECTS,
        max_meshlets: culling::MAX_MESHLETS,
        max_draw_indirect_calls: culling::MAX_DRAW_INDIRECT_CALLS,
        meshlet_max_triangles: meshlet::MAX_TRIANGLES,
        buffered_frames: culling::BUFFERED_FRAMES,
        batch_overlap: culling::CULL_DRAW_BATCH_OVERLAP,
    };

    /// One batch is one indirect draw call
    pub fn max_commands_per_batch(&self) -> u32 {
        self.max_draw_indirect_calls
    }

    /// Indirect-call budget plus one batch of slack
    pub fn max_command_count(&self) -> u32 {
        self.max_draw_indirect_calls + self.max_commands_per_batch()
    }

    pub fn sub_batch_count(&self) -> u32 {
        self.max_command_count().div_ceil(self.max_commands_per_batch())
    }

    pub fn max_triangles_per_batch(&self) -> u32 {
        self.max_commands_per_batch() * self.meshlet_max_triangles
    }

    pub fn triangle_groups_per_meshlet(&self) -> u32 {
        self.meshlet_max_triangles.div_ceil(meshlet::TRIANGLE_GROUP_SIZE)
    }

    pub fn validate(&self) -> CullResult<()> {
        let fail = |reason: String| Err(CullError::InvalidLimits { reason });

        if self.max_objects == 0 || self.max_meshlets == 0 {
            return fail("object and meshlet bounds must be non-zero".into());
        }
        if self.max_draw_indirect_calls == 0 {
            return fail("indirect-call budget must be non-zero".into());
        }
        if self.meshlet_max_triangles == 0 || self.triangle_groups_per_meshlet() > meshlet::MAX_TRIANGLE_GROUPS {
            return fail(format!(
                "meshlet triangle budget {} outside 1..={}",
                self.meshlet_max_triangles,
                meshlet::MAX_TRIANGLE_GROUPS * meshlet::TRIANGLE_GROUP_SIZE
            ));
        }
        if self.buffered_frames == 0 || self.batch_overlap == 0 {
            return fail("buffering depths must be at least 1".into());
        }
        // One workgroup per object and per command, so both must fit a dispatch dimension
        if self.max_objects > 65_535 || self.max_commands_per_batch() > 65_535 {
            return fail("objects and commands per batch must fit one dispatch dimension".into());
        }
        let index_words = self.max_triangles_per_batch() as u64 * 3 * self.batch_overlap as u64;
        if index_words > u32::MAX as u64 {
            return fail(format!("batch index allocation of {} words overflows u32 indexing", index_words));
        }
        Ok(())
    }
}

impl Default for CullLimits {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Per-test switches carried into the cull data flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CullToggles {
    pub frustum: bool,
    pub occlusion: bool,
    pub cone: bool,
    /// When false the triangle kernel keeps every triangle
    pub triangles: bool,
    /// Run the second pass against the rebuilt pyramid
    pub reocclusion: bool,
}

impl CullToggles {
    pub fn bits(&self) -> u32 {
        let mut bits = 0;
        if self.frustum {
            bits |= flags::CULL_FRUSTUM;
        }
        if self.occlusion {
            bits |= flags::CULL_OCCLUSION;
        }
        if self.cone {
            bits |= flags::CULL_CONE;
        }
        if self.triangles {
            bits |= flags::CULL_TRIANGLES;
        }
        bits
    }
}

impl Default for CullToggles {
    fn default() -> Self {
        Self {
            frustum: true,
            occlusion: true,
            cone: true,
            triangles: true,
            reocclusion: true,
        }
    }
}

/// Top-level culling configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CullConfig {
    pub limits: CullLimits,
    pub toggles: CullToggles,
}

impl CullConfig {
    pub fn from_toml_str(source: &str) -> CullResult<Self> {
        let config: CullConfig = toml::from_str(source)?;
        config.limits.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> CullResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        log::info!("[CullConfig::load] Loading culling config from {}", path.display());
        Self::from_toml_str(&source)
    }
}
