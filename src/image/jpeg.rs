use std::{
    env::{self, VarError},
    process,
};

use anyhow::bail;
use image::ImageBuffer;
use once_cell::sync::Lazy;

use super::Image;

const ENV_VAR_JPEG_BACKEND: &str = "HANDCAM_JPEG_BACKEND";

/// The supported JPEG decoding backends.
#[derive(Debug)]
enum JpegBackend {
    /// Uses the `image` crate's decoder (which wraps `jpeg-decoder`). Robust but not very fast.
    Image,
    /// Uses the `zune-jpeg` crate, a pure-Rust JPEG decoder somewhat faster than `jpeg-decoder`.
    ZuneJpeg,
}

const DEFAULT_BACKEND: JpegBackend = JpegBackend::Image;

static JPEG_BACKEND: Lazy<JpegBackend> = Lazy::new(|| {
    let backend = match env::var(ENV_VAR_JPEG_BACKEND) {
        Ok(v) if v == "image" => JpegBackend::Image,
        Ok(v) if v == "zune-jpeg" => JpegBackend::ZuneJpeg,
        Ok(v) => {
            eprintln!("invalid value set for `{ENV_VAR_JPEG_BACKEND}` variable: '{v}'; exiting");
            process::exit(1);
        }
        Err(VarError::NotPresent) => DEFAULT_BACKEND,
        Err(VarError::NotUnicode(s)) => {
            eprintln!(
                "invalid value set for `{ENV_VAR_JPEG_BACKEND}` variable: {}; exiting",
                s.to_string_lossy()
            );
            process::exit(1);
        }
    };
    log::debug!("using JPEG decode backend: {:?}", backend);
    backend
});

pub(super) fn decode_jpeg(data: &[u8]) -> anyhow::Result<Image> {
    let buf = match *JPEG_BACKEND {
        JpegBackend::Image => {
            image::load_from_memory_with_format(data, image::ImageFormat::Jpeg)?.to_rgba8()
        }
        JpegBackend::ZuneJpeg => {
            use zune_jpeg::zune_core::colorspace::ColorSpace;
            use zune_jpeg::zune_core::options::DecoderOptions;

            let mut decomp = zune_jpeg::JpegDecoder::new_with_options(
                DecoderOptions::new_fast().jpeg_set_out_colorspace(ColorSpace::RGBA),
                data,
            );
            decomp.decode_headers()?;
            let colorspace = decomp.get_output_colorspace();
            if colorspace != Some(ColorSpace::RGBA) {
                bail!("unsupported colorspace {colorspace:?} (expected RGBA)");
            }

            let Some(size) = decomp.output_buffer_size() else {
                bail!("JPEG decoder did not report an output size");
            };
            let mut buf = vec![0; size];
            decomp.decode_into(&mut buf)?;
            let Some((width, height)) = decomp.dimensions() else {
                bail!("JPEG decoder did not report image dimensions");
            };
            match ImageBuffer::from_raw(width.into(), height.into(), buf) {
                Some(buf) => buf,
                None => bail!("decoded JPEG data does not match its {width}x{height} size"),
            }
        }
    };

    Ok(Image::from_buffer(buf))
}
