//! Thumbnails are small previews for image items, written next to the
//! cache tree.  Generating one is best effort: a corrupt or unsupported
//! image only costs a log line, and never leaves a partial thumbnail.
use std::io::Cursor;
use std::io::Write;

use image::imageops::FilterType;
use image::DynamicImage;
use image::GenericImageView;
use image::ImageFormat;
use tracing::debug;
use tracing::warn;

use crate::descriptor::EvidenceDescriptor;
use crate::error::Result;
use crate::layout::CacheLayout;
use crate::object_pool::StreamLease;
use crate::object_pool::StreamPool;
use crate::publish;

#[derive(Clone, Debug)]
pub struct Thumbnailer {
    layout: CacheLayout,
    size: u32,
}

/// Scales `image` down to fit in a `size`-pixel square, keeping its
/// aspect ratio.  Images that already fit are left alone.
fn shrink(image: DynamicImage, size: u32) -> DynamicImage {
    let (width, height) = image.dimensions();
    if width <= size && height <= size {
        return image;
    }

    image.resize(size, size, FilterType::Lanczos3)
}

/// Encodes `image` as `format`, or as PNG if we can't write `format`.
fn encode(image: &DynamicImage, format: ImageFormat) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    match image.write_to(&mut out, format) {
        Ok(()) => return Ok(out.into_inner()),
        Err(e) if format == ImageFormat::Png => return Err(e.into()),
        Err(e) => debug!(?format, error = %e, "falling back to png thumbnail"),
    }

    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}

impl Thumbnailer {
    pub fn new(layout: CacheLayout, size: u32) -> Thumbnailer {
        Thumbnailer {
            layout,
            size: size.max(1),
        }
    }

    /// Makes sure an image item has a thumbnail.  Returns whether this
    /// call wrote one: false for non-images, for items that already
    /// have a thumbnail, and on failure (which is logged).
    pub fn ensure_thumbnail<P: StreamPool + ?Sized>(
        &self,
        pool: &P,
        desc: &EvidenceDescriptor,
    ) -> bool {
        if !desc.is_image() || desc.thumbnail_cache_path.is_file() {
            return false;
        }

        match self.generate(pool, desc) {
            Ok(written) => written,
            Err(e) => {
                warn!(item = %desc.id, error = %e, "failed to create thumbnail");
                false
            }
        }
    }

    fn load<P: StreamPool + ?Sized>(
        &self,
        pool: &P,
        desc: &EvidenceDescriptor,
    ) -> Result<Option<Vec<u8>>> {
        // Incomplete copies are read from the container instead.
        if desc.has_complete_copy() {
            match std::fs::read(&desc.file_cache_path) {
                Ok(data) => return Ok(Some(data)),
                Err(e) if crate::benign_error::is_absent_file_error(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }

        match StreamLease::acquire(pool, &desc.id)? {
            Some(lease) => Ok(Some(lease.read_to_end()?)),
            None => Ok(None),
        }
    }

    fn generate<P: StreamPool + ?Sized>(&self, pool: &P, desc: &EvidenceDescriptor) -> Result<bool> {
        let data = match self.load(pool, desc)? {
            Some(data) => data,
            None => {
                debug!(item = %desc.id, "object pool full, skipping thumbnail");
                return Ok(false);
            }
        };

        let format = if desc.content_type == "image/jpeg" {
            ImageFormat::Jpeg
        } else {
            image::guess_format(&data).unwrap_or(ImageFormat::Png)
        };
        let thumbnail = shrink(image::load_from_memory(&data)?, self.size);
        let bytes = encode(&thumbnail, format)?;

        std::fs::create_dir_all(&desc.thumbnail_cache_dir)?;
        let mut staged = self.layout.stage()?;
        staged.write_all(&bytes)?;
        let written = publish::publish(staged, &desc.thumbnail_cache_path, None, None)?;
        if written {
            debug!(item = %desc.id, ?format, "created thumbnail");
        }

        Ok(written)
    }
}

#[cfg(test)]
mod test {
    use crate::descriptor::EvidenceDescriptor;
    use crate::handle_pool::HandlePool;
    use crate::memory::MemoryContainer;
    use crate::metadata;
    use crate::object_pool::ObjectPool;
    use crate::thumbnail::*;
    use image::RgbImage;
    use std::sync::Arc;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let image = DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        }));
        let mut out = Cursor::new(Vec::new());
        image
            .write_to(&mut out, ImageFormat::Png)
            .expect("encoding must succeed");
        out.into_inner()
    }

    fn jpeg(width: u32, height: u32) -> Vec<u8> {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, image::Rgb([200, 10, 10])));
        let mut out = Cursor::new(Vec::new());
        image
            .write_to(&mut out, ImageFormat::Jpeg)
            .expect("encoding must succeed");
        out.into_inner()
    }

    struct Fixture {
        _temp: test_dir::TestDir,
        container: MemoryContainer,
        pool: ObjectPool<MemoryContainer>,
        layout: CacheLayout,
    }

    fn fixture() -> Fixture {
        use test_dir::{DirBuilder, TestDir};

        let temp = TestDir::temp();
        let layout = CacheLayout::new(temp.path("cache"));
        layout.create_directories().expect("mkdir must succeed");
        let container = MemoryContainer::new();
        let handles = Arc::new(HandlePool::new(Arc::new(container.clone()), 1));

        Fixture {
            _temp: temp,
            pool: ObjectPool::new(handles, 4),
            container,
            layout,
        }
    }

    fn descriptor(f: &Fixture, location: &str, data: Vec<u8>, content_type: &str) -> EvidenceDescriptor {
        let id = f.container.add_file(location, data);
        let meta = metadata::describe(&**f.pool.handles(), &id, false).expect("describe must succeed");
        EvidenceDescriptor::new(id, meta, &f.layout).with_content_type(content_type, true)
    }

    #[test]
    fn test_large_png_is_shrunk() {
        let f = fixture();
        let desc = descriptor(&f, "/wide.png", png(256, 128), "image/png");
        let thumbnailer = Thumbnailer::new(f.layout.clone(), 64);

        assert!(thumbnailer.ensure_thumbnail(&f.pool, &desc));

        let thumb = image::open(&desc.thumbnail_cache_path).expect("thumbnail must decode");
        assert_eq!(thumb.dimensions(), (64, 32));
        assert_eq!(
            image::guess_format(&std::fs::read(&desc.thumbnail_cache_path).expect("read")).expect("format"),
            ImageFormat::Png
        );
        // Read through the pool, which is empty again.
        assert!(f.pool.is_empty());
        assert_eq!(f.container.live_streams(), 0);
    }

    #[test]
    fn test_small_image_and_idempotence() {
        let f = fixture();
        let desc = descriptor(&f, "/icon.png", png(16, 16), "image/png");
        let thumbnailer = Thumbnailer::new(f.layout.clone(), 64);

        assert!(thumbnailer.ensure_thumbnail(&f.pool, &desc));
        let thumb = image::open(&desc.thumbnail_cache_path).expect("thumbnail must decode");
        assert_eq!(thumb.dimensions(), (16, 16));

        // The second call finds the thumbnail and doesn't even read the item.
        let opens = f.container.stream_opens("/icon.png");
        assert!(!thumbnailer.ensure_thumbnail(&f.pool, &desc));
        assert_eq!(f.container.stream_opens("/icon.png"), opens);
    }

    #[test]
    fn test_jpeg_stays_jpeg() {
        let f = fixture();
        let desc = descriptor(&f, "/photo.jpg", jpeg(100, 200), "image/jpeg");
        let thumbnailer = Thumbnailer::new(f.layout.clone(), 64);

        assert!(thumbnailer.ensure_thumbnail(&f.pool, &desc));
        let bytes = std::fs::read(&desc.thumbnail_cache_path).expect("read must succeed");
        assert_eq!(image::guess_format(&bytes).expect("format"), ImageFormat::Jpeg);
        let thumb = image::load_from_memory(&bytes).expect("thumbnail must decode");
        assert_eq!(thumb.dimensions(), (32, 64));
    }

    #[test]
    fn test_non_image_is_skipped() {
        let f = fixture();
        let desc = descriptor(&f, "/notes.txt", b"hello".to_vec(), "text/plain");
        let thumbnailer = Thumbnailer::new(f.layout.clone(), 64);

        assert!(!thumbnailer.ensure_thumbnail(&f.pool, &desc));
        assert!(!desc.thumbnail_cache_dir.exists());
        assert_eq!(f.container.stream_opens("/notes.txt"), 0);
    }

    #[test]
    fn test_corrupt_image_leaves_nothing() {
        let f = fixture();
        let mut data = png(32, 32);
        data.truncate(40);
        let desc = descriptor(&f, "/broken.png", data, "image/png");
        let thumbnailer = Thumbnailer::new(f.layout.clone(), 64);

        assert!(!thumbnailer.ensure_thumbnail(&f.pool, &desc));
        assert!(!desc.thumbnail_cache_path.exists());
        assert_eq!(
            std::fs::read_dir(f.layout.staging_dir()).expect("readdir").count(),
            0
        );
    }

    #[test]
    fn test_prefers_cached_copy() {
        let f = fixture();
        // Same length as the item, different pixels: the thumbnail shows
        // which one was decoded.
        let cached = png(80, 40);
        let mut item = png(8, 8);
        item.resize(cached.len(), 0);
        let desc = descriptor(&f, "/cached.png", item, "image/png");
        std::fs::create_dir_all(&desc.file_cache_dir).expect("mkdir must succeed");
        std::fs::write(&desc.file_cache_path, cached).expect("write must succeed");

        let thumbnailer = Thumbnailer::new(f.layout.clone(), 64);
        assert!(thumbnailer.ensure_thumbnail(&f.pool, &desc));
        assert_eq!(f.container.stream_opens("/cached.png"), 0);

        let thumb = image::open(&desc.thumbnail_cache_path).expect("thumbnail must decode");
        assert_eq!(thumb.dimensions(), (64, 32));
    }

    #[test]
    fn test_truncated_copy_falls_back_to_container() {
        let f = fixture();
        let item = png(40, 20);
        let desc = descriptor(&f, "/short.png", item.clone(), "image/png");
        std::fs::create_dir_all(&desc.file_cache_dir).expect("mkdir must succeed");
        std::fs::write(&desc.file_cache_path, &item[..item.len() / 2]).expect("write must succeed");

        let thumbnailer = Thumbnailer::new(f.layout.clone(), 64);
        assert!(thumbnailer.ensure_thumbnail(&f.pool, &desc));
        assert_eq!(f.container.stream_opens("/short.png"), 1);

        let thumb = image::open(&desc.thumbnail_cache_path).expect("thumbnail must decode");
        assert_eq!(thumb.dimensions(), (40, 20));
    }
}
