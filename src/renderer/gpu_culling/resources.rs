//! Resource registry
//!
//! Backend-neutral descriptions of every buffer and texture the pipeline
//! touches. Executors allocate their own storage per handle.

use bitflags::bitflags;

use super::arena::{Arena, Handle};
use crate::error::{CullError, CullResult};

bitflags! {
    /// How a buffer is used on the device
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const UNIFORM = 1 << 0;
        const STORAGE = 1 << 1;
        const INDIRECT = 1 << 2;
        const INDEX = 1 << 3;
        const COPY_DST = 1 << 4;
        const COPY_SRC = 1 << 5;
    }
}

#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub label: String,
    pub size: u64,
    pub usage: BufferUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Depth32Float,
    R32Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureLayout {
    Undefined,
    DepthAttachment,
    ShaderReadOnly,
    General,
}

#[derive(Debug, Clone)]
pub struct TextureDesc {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub format: TextureFormat,
    /// Imported textures are owned by the renderer (the depth target)
    pub imported: bool,
}

impl TextureDesc {
    pub fn mip_size(&self, level: u32) -> (u32, u32) {
        ((self.width >> level).max(1), (self.height >> level).max(1))
    }
}

pub type BufferHandle = Handle<BufferDesc>;
pub type TextureHandle = Handle<TextureDesc>;

/// Byte range of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferSlice {
    pub buffer: BufferHandle,
    pub offset: u64,
    pub size: u64,
}

impl BufferSlice {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    pub fn overlaps(&self, other: &BufferSlice) -> bool {
        self.buffer == other.buffer && self.offset < other.end() && other.offset < self.end()
    }

    pub fn contains(&self, other: &BufferSlice) -> bool {
        self.buffer == other.buffer && self.offset <= other.offset && other.end() <= self.end()
    }

    /// Sub-range relative to this slice
    pub fn sub(&self, offset: u64, size: u64) -> BufferSlice {
        debug_assert!(offset + size <= self.size, "sub-slice out of range");
        BufferSlice {
            buffer: self.buffer,
            offset: self.offset + offset,
            size,
        }
    }
}

#[derive(Default)]
pub struct ResourceRegistry {
    buffers: Arena<BufferDesc>,
    textures: Arena<TextureDesc>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_buffer(&mut self, label: &str, size: u64, usage: BufferUsage) -> BufferHandle {
        // Kernels view every buffer as 32-bit words
        let size = size.max(4).next_multiple_of(4);
        log::debug!("[ResourceRegistry] buffer '{}' {} bytes {:?}", label, size, usage);
        self.buffers.insert(BufferDesc {
            label: label.to_string(),
            size,
            usage,
        })
    }

    pub fn create_texture(&mut self, desc: TextureDesc) -> TextureHandle {
        log::debug!(
            "[ResourceRegistry] texture '{}' {}x{} mips {} {:?}",
            desc.label,
            desc.width,
            desc.height,
            desc.mip_levels,
            desc.format
        );
        self.textures.insert(desc)
    }

    pub fn destroy_buffer(&mut self, handle: BufferHandle) -> Option<BufferDesc> {
        self.buffers.remove(handle)
    }

    pub fn destroy_texture(&mut self, handle: TextureHandle) -> Option<TextureDesc> {
        self.textures.remove(handle)
    }

    pub fn buffer(&self, handle: BufferHandle) -> CullResult<&BufferDesc> {
        self.buffers.get(handle).ok_or(CullError::StaleHandle {
            kind: "buffer",
            index: handle.index(),
            generation: handle.generation(),
        })
    }

    pub fn texture(&self, handle: TextureHandle) -> CullResult<&TextureDesc> {
        self.textures.get(handle).ok_or(CullError::StaleHandle {
            kind: "texture",
            index: handle.index(),
            generation: handle.generation(),
        })
    }

    /// Owner-side resize. Executors reallocate their own textures on next
    /// use; an imported texture has to be imported again by its owner.
    pub fn resize_texture(&mut self, handle: TextureHandle, width: u32, height: u32) -> CullResult<()> {
        let desc = self.textures.get_mut(handle).ok_or(CullError::StaleHandle {
            kind: "texture",
            index: handle.index(),
            generation: handle.generation(),
        })?;
        desc.width = width;
        desc.height = height;
        Ok(())
    }

    pub fn whole(&self, handle: BufferHandle) -> CullResult<BufferSlice> {
        Ok(BufferSlice {
            buffer: handle,
            offset: 0,
            size: self.buffer(handle)?.size,
        })
    }

    pub fn buffers(&self) -> impl Iterator<Item = (BufferHandle, &BufferDesc)> {
        self.buffers.iter()
    }

    pub fn textures(&self) -> impl Iterator<Item = (TextureHandle, &TextureDesc)> {
        self.textures.iter()
    }
}

/// Explicitly owned culling context. Replaces renderer-global resource caches:
/// the pipeline receives it by reference and keeps only the handles it needs.
#[derive(Default)]
pub struct CullContext {
    pub resources: ResourceRegistry,
}

impl CullContext {
    pub fn new() -> Self {
        Self::default()
    }
}
