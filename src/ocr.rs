use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};

use crate::error::Error;

/// ImageMagick preprocessing applied to a framebuffer dump before
/// recognition. Tuned for low-resolution console text.
const CONVERT_ARGS: &[&str] = &[
    "-filter",
    "Catrom",
    "-density",
    "72",
    "-resample",
    "300",
    "-contrast",
    "-normalize",
    "-despeckle",
    "-type",
    "grayscale",
    "-sharpen",
    "1",
    "-posterize",
    "3",
    "-negate",
    "-gamma",
    "100",
    "-blur",
    "1x65535",
];

/// Façade over the external OCR pipeline (ImageMagick plus tesseract).
pub struct Ocr {
    enabled: bool,
}

impl Ocr {
    /// A façade with a fixed availability, for when the test runner
    /// decides up front whether OCR is part of the run.
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Probe the host for a usable tesseract binary.
    pub fn detect() -> Self {
        let enabled = Command::new("tesseract")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false);
        Self { enabled }
    }

    /// Whether recognition is available on this host.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Run recognition over `screenshot`, once per model id.
    ///
    /// Returns one text candidate per id, in order. The screenshot is
    /// first preprocessed into a TIFF next to the input file.
    pub fn recognize(&self, screenshot: &Path, model_ids: &[u32]) -> Result<Vec<String>> {
        if !self.enabled {
            return Err(Error::OcrUnavailable.into());
        }

        let tiff = PathBuf::from(format!("{}.tiff", screenshot.display()));
        let convert = Command::new("convert")
            .args(CONVERT_ARGS)
            .arg(screenshot)
            .arg(format!("tiff:{}", tiff.display()))
            .output()
            .context("Failed to run convert")?;
        if !convert.status.success() {
            return Err(
                Error::ImageConversionFailed(convert.status.code().unwrap_or(-1)).into(),
            );
        }

        let mut variants = Vec::with_capacity(model_ids.len());
        for model_id in model_ids {
            let recognized = Command::new("tesseract")
                .arg(&tiff)
                .arg("-")
                .args(["-c", "debug_file=/dev/null", "--psm", "11", "--oem"])
                .arg(model_id.to_string())
                .output()
                .context("Failed to run tesseract")?;
            if !recognized.status.success() {
                bail!(
                    "OCR failed with exit code {}",
                    recognized.status.code().unwrap_or(-1)
                );
            }
            variants.push(String::from_utf8_lossy(&recognized.stdout).into_owned());
        }

        Ok(variants)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_facade_refuses_recognition() {
        let ocr = Ocr::new(false);
        let err = ocr.recognize(Path::new("/tmp/screen.ppm"), &[0, 1, 2]).unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::OcrUnavailable) => (),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
