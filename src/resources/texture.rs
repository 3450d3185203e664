use crate::core::slot_pool::Handle;
use crate::memory::{BufferAddress, BufferManager};
use crate::resources::{FrameReplicated, FrameResource, ResourceError};
use crate::rhi::{BufferUsage, CommandList, Device, Image, ImageCreateInfo, SharingMode, TextureFormat};
use cgmath::Vector2;
use log::debug;
use std::{fmt, mem};

/// CPU-side pixels of a [`Texture`].
#[derive(Debug, Clone)]
pub struct TextureData {
    pixels: Vec<u8>,
    extent: Vector2<u32>,
    format: TextureFormat,
}

impl TextureData {
    /// Checks that `pixels` holds exactly one tightly packed image of the given extent and format.
    pub fn new(extent: Vector2<u32>, format: TextureFormat, pixels: Vec<u8>) -> Result<Self, ResourceError> {
        let expected = ImageCreateInfo { extent, format }.byte_size();
        if pixels.len() as u64 != expected {
            return Err(ResourceError::InvalidPixelData {
                expected,
                actual: pixels.len() as u64,
            });
        }

        Ok(TextureData { pixels, extent, format })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn extent(&self) -> Vector2<u32> {
        self.extent
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    fn create_info(&self) -> ImageCreateInfo {
        ImageCreateInfo {
            extent: self.extent,
            format: self.format,
        }
    }
}

/// One frame's copy of a [`Texture`].
pub struct TextureSlot<D: Device> {
    pub image: D::Image,

    /// Staging reservation of the last upload.
    pub staging: Option<Handle<BufferAddress<D>>>,
}

impl<D: Device> fmt::Debug for TextureSlot<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextureSlot")
            .field("extent", &self.image.extent())
            .field("format", &self.image.format())
            .field("staging", &self.staging)
            .finish()
    }
}

/// What the renderer needs to know about one frame's copy of a [`Texture`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TextureView {
    pub extent: Vector2<u32>,
    pub format: TextureFormat,
}

/// A texture the CPU can rewrite or resize, with one image per frame in flight
///
/// A slot whose image no longer matches the texture's extent or format isn't ready for use, and gets a new image on
/// its next commit.
pub type Texture<D, const COPIES: usize> = FrameReplicated<D, TextureData, COPIES>;

impl<D: Device, const COPIES: usize> FrameReplicated<D, TextureData, COPIES> {
    /// Creates a texture from tightly packed pixels.
    pub fn from_pixels(extent: Vector2<u32>, format: TextureFormat, pixels: Vec<u8>) -> Result<Self, ResourceError> {
        Ok(FrameReplicated::new(TextureData::new(extent, format, pixels)?))
    }

    /// Replaces the texture's pixels, possibly with an image of a different size or format.
    pub fn set_pixels(
        &mut self,
        extent: Vector2<u32>,
        format: TextureFormat,
        pixels: Vec<u8>,
    ) -> Result<(), ResourceError> {
        let data = TextureData::new(extent, format, pixels)?;
        self.update(|texture| *texture = data);

        Ok(())
    }
}

impl<D: Device> FrameResource<D> for TextureData {
    type Content = TextureSlot<D>;
    type RenderData = TextureView;

    fn create_gpu_data(&mut self, manager: &mut BufferManager<D>) -> Result<TextureSlot<D>, ResourceError> {
        let image = manager.device().create_image(self.create_info())?;

        Ok(TextureSlot { image, staging: None })
    }

    fn write_transfer(
        &mut self,
        content: &mut TextureSlot<D>,
        manager: &mut BufferManager<D>,
        writer: &mut D::CommandList,
    ) -> Result<(), ResourceError> {
        if !FrameResource::<D>::ready_for_use(self, content) {
            let image = manager.device().create_image(self.create_info())?;
            let old_image = mem::replace(&mut content.image, image);
            manager.device().destroy_image(old_image);
            debug!(
                "Recreated texture image at {}x{} {:?}",
                self.extent.x, self.extent.y, self.format
            );
        }

        if let Some(staging) = content.staging.take() {
            manager.release_address(staging)?;
        }

        let staging = manager.reserve_buffer(
            self.pixels.len() as u64,
            BufferUsage::STAGING,
            SharingMode::HostVisible,
        )?;
        content.staging = Some(staging);
        manager.memory_copy(staging, &self.pixels)?;

        let source = manager.get_buffer_access_data(staging)?;
        writer.copy_buffer_to_image(&content.image, source.buffer, source.offset);

        Ok(())
    }

    fn release_data(&mut self, content: TextureSlot<D>, manager: &mut BufferManager<D>) -> Result<(), ResourceError> {
        manager.device().destroy_image(content.image);
        if let Some(staging) = content.staging {
            manager.release_address(staging)?;
        }

        Ok(())
    }

    fn ready_for_use(&self, content: &TextureSlot<D>) -> bool {
        content.image.extent() == self.extent && content.image.format() == self.format
    }

    fn render_data(&self, content: &TextureSlot<D>, _manager: &BufferManager<D>) -> Result<TextureView, ResourceError> {
        Ok(TextureView {
            extent: content.image.extent(),
            format: content.image.format(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rhi::headless::{HeadlessCommandList, HeadlessDevice};
    use crate::rhi::QueueType;
    use crate::settings::MemorySettings;
    use matches::assert_matches;

    fn setup() -> (BufferManager<HeadlessDevice>, HeadlessCommandList) {
        let manager = BufferManager::new(HeadlessDevice::new(), MemorySettings::default()).unwrap();
        let writer = manager.device().create_command_list(QueueType::Graphics).unwrap();
        (manager, writer)
    }

    fn submit(manager: &BufferManager<HeadlessDevice>, writer: &mut HeadlessCommandList) {
        writer.end();
        manager.device().submit_commands(writer, None);
        writer.begin();
    }

    #[test]
    fn pixels_must_match_the_extent() {
        let result = Texture::<HeadlessDevice, 2>::from_pixels(Vector2::new(2, 2), TextureFormat::Rgba8, vec![0; 15]);

        assert_matches!(
            result.err(),
            Some(ResourceError::InvalidPixelData {
                expected: 16,
                actual: 15
            })
        );
    }

    #[test]
    fn commit_uploads_pixels() {
        let (mut manager, mut writer) = setup();
        let pixels: Vec<u8> = (0..16).collect();
        let mut texture = Texture::<_, 2>::from_pixels(Vector2::new(2, 2), TextureFormat::Rgba8, pixels.clone()).unwrap();

        let view = texture
            .get_render_data_commit_update(0, &mut manager, &mut writer)
            .unwrap();
        assert_eq!(view.extent, Vector2::new(2, 2));
        submit(&manager, &mut writer);

        assert_eq!(texture.content(0).unwrap().image.pixels(), pixels);
        assert!(!texture.ready_for_use(1));
    }

    #[test]
    fn resizing_recreates_the_image() {
        let (mut manager, mut writer) = setup();
        let mut texture = Texture::<_, 1>::from_pixels(Vector2::new(1, 1), TextureFormat::R8, vec![3]).unwrap();
        texture.commit(0, &mut manager, &mut writer).unwrap();
        submit(&manager, &mut writer);
        let first_image = texture.content(0).unwrap().image.id();

        texture
            .set_pixels(Vector2::new(2, 1), TextureFormat::R8, vec![4, 5])
            .unwrap();
        assert!(!texture.ready_for_use(0));

        texture.commit(0, &mut manager, &mut writer).unwrap();
        submit(&manager, &mut writer);
        let slot = texture.content(0).unwrap();
        assert_ne!(slot.image.id(), first_image);
        assert_eq!(slot.image.pixels(), vec![4, 5]);
        assert!(texture.ready_for_use(0));
    }

    #[test]
    fn release_destroys_images() {
        let (mut manager, mut writer) = setup();
        let mut texture = Texture::<_, 2>::from_pixels(Vector2::new(4, 4), TextureFormat::R8, vec![1; 16]).unwrap();
        texture.commit(0, &mut manager, &mut writer).unwrap();
        texture.commit(1, &mut manager, &mut writer).unwrap();
        submit(&manager, &mut writer);

        let before = manager.device().live_allocations();
        texture.release(&mut manager).unwrap();
        assert_eq!(manager.device().live_allocations(), before - 2);
        assert_eq!(manager.address_count(), 0);
    }
}
