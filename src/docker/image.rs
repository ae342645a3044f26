use crate::docker::{
    Extract, ImageArchive, LayerExtraction, LayerExtractor, LayerMember, LayerOutcome, LayerReport,
    UnpackSummary, LAYER_SUFFIX,
};
use crate::error::{Result, UnlayerError};
use chrono::Utc;
use log::{error, info, warn};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Options for an unpack run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackOptions {
    /// Member name suffix identifying nested layer archives
    pub layer_suffix: String,
    /// Leave each nested archive next to its unpacked contents
    pub keep_archives: bool,
}

impl Default for UnpackOptions {
    fn default() -> Self {
        UnpackOptions {
            layer_suffix: LAYER_SUFFIX.to_string(),
            keep_archives: false,
        }
    }
}

/// Unpacks every layer of a saved image archive into its own directory.
///
/// For a member `abc123/layer.tar` the result is `<output>/abc123/layer/`.
/// A failing layer is recorded and the remaining layers are still processed.
pub struct ImageUnpacker<E = LayerExtractor> {
    options: UnpackOptions,
    extractor: E,
}

impl ImageUnpacker {
    pub fn new(options: UnpackOptions) -> Self {
        let extractor = LayerExtractor::new().keep_archive(options.keep_archives);
        ImageUnpacker { options, extractor }
    }
}

impl<E: Extract> ImageUnpacker<E> {
    pub fn with_extractor(options: UnpackOptions, extractor: E) -> Self {
        ImageUnpacker { options, extractor }
    }

    pub fn options(&self) -> &UnpackOptions {
        &self.options
    }

    /// Unpack `archive_path` under `output_root`.
    ///
    /// Fails when the output root can't be created, when the image archive
    /// can't be opened, or when every layer failed. Otherwise returns the
    /// per-layer reports, which may include failures.
    pub fn unpack(&self, archive_path: &Path, output_root: &Path) -> Result<UnpackSummary> {
        let started_at = Utc::now();

        create_dir(output_root)?;
        let archive = ImageArchive::open(archive_path)?;

        let layers = archive.locate_layers(&self.options.layer_suffix);
        if layers.is_empty() {
            warn!(
                "No members ending in '{}' found in {}",
                self.options.layer_suffix,
                archive_path.display()
            );
        } else {
            info!(
                "Found {} layers in {}",
                layers.len(),
                archive_path.display()
            );
        }

        let mut reports: HashMap<usize, LayerReport> = HashMap::with_capacity(layers.len());
        let streamed = archive.for_each_layer(&layers, |layer, data| {
            reports.insert(layer.index, self.process_layer(layer, data, output_root));
        });
        let stream_error = streamed.err().map(|err| err.to_string());

        // Reports follow listing order; anything never streamed counts as failed
        let reports = layers
            .iter()
            .map(|layer| {
                reports.remove(&layer.index).unwrap_or_else(|| {
                    let reason = match (layer.data_index, &stream_error) {
                        (None, _) => layer.not_regular().to_string(),
                        (Some(_), Some(err)) => err.clone(),
                        (Some(_), None) => "member not found in archive".to_string(),
                    };
                    failed_report(layer, output_root, reason)
                })
            })
            .collect();

        let summary = UnpackSummary {
            archive: archive_path.to_path_buf(),
            output_root: output_root.to_path_buf(),
            started_at,
            finished_at: Utc::now(),
            layers: reports,
        };
        summary.log_summary();

        if summary.all_failed() {
            return Err(UnlayerError::AllLayersFailed(Box::new(summary)));
        }

        Ok(summary)
    }

    /// Run one layer through to a terminal outcome
    fn process_layer(&self, layer: &LayerMember, data: &mut dyn Read, output_root: &Path) -> LayerReport {
        let layer_dir = reported_layer_dir(layer, output_root);
        let outcome = match self.extract_member(layer, data, output_root) {
            Ok(LayerExtraction::Extracted(extracted)) => LayerOutcome::Extracted(extracted),
            Ok(LayerExtraction::SkippedMissing { path }) => {
                let reason = UnlayerError::MissingLayerFile { path }.to_string();
                warn!("Skipped layer {}: {}", layer.path, reason);
                LayerOutcome::Skipped { reason }
            }
            Err(err) => {
                warn!("Failed layer {}: {}", layer.path, err);
                LayerOutcome::Failed {
                    error: err.to_string(),
                }
            }
        };

        LayerReport {
            member: layer.path.clone(),
            layer_dir,
            outcome,
        }
    }

    /// Write the member to `<layer_dir>/<file name>` and hand it to the extractor
    fn extract_member(
        &self,
        layer: &LayerMember,
        data: &mut dyn Read,
        output_root: &Path,
    ) -> Result<LayerExtraction> {
        let layer_dir = layer.layer_dir(output_root)?;
        let file_name = layer.file_name()?;
        create_dir(&layer_dir)?;

        let layer_archive = layer_dir.join(file_name);
        info!(
            "Extracting {} to {}",
            layer.path,
            layer_archive.display()
        );
        write_member(data, &layer_dir, &layer_archive)?;

        self.extractor.extract_layer(&layer_archive, &layer_dir)
    }
}

/// Recursive and idempotent
fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|source| UnlayerError::DirectoryCreate {
        path: path.to_path_buf(),
        source,
    })
}

/// Stage the member bytes in `dir` and move them into place once complete
fn write_member(data: &mut dyn Read, dir: &Path, target: &Path) -> Result<()> {
    let mut staged = NamedTempFile::new_in(dir)?;
    io::copy(data, &mut staged)?;
    staged.persist(target).map_err(|err| err.error)?;
    Ok(())
}

/// The layer directory, or the raw joined path for a rejected member
fn reported_layer_dir(layer: &LayerMember, output_root: &Path) -> PathBuf {
    layer
        .layer_dir(output_root)
        .unwrap_or_else(|_| output_root.join(layer.parent_dir()))
}

fn failed_report(layer: &LayerMember, output_root: &Path, error: String) -> LayerReport {
    error!("Failed layer {}: {}", layer.path, error);
    LayerReport {
        member: layer.path.clone(),
        layer_dir: reported_layer_dir(layer, output_root),
        outcome: LayerOutcome::Failed { error },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::Cleanup;
    use std::cell::RefCell;
    use std::fs::File;
    use tar::{Builder, Header};
    use tempfile::TempDir;

    fn append_file<W: std::io::Write>(builder: &mut Builder<W>, path: &str, data: &[u8]) {
        let mut header = Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, data).unwrap();
    }

    fn layer_tar_bytes(files: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = Builder::new(Vec::new());
        for (name, content) in files {
            append_file(&mut builder, name, content.as_bytes());
        }
        builder.into_inner().unwrap()
    }

    fn write_image(path: &Path, members: &[(&str, Vec<u8>)]) {
        let mut builder = Builder::new(File::create(path).unwrap());
        for (name, data) in members {
            append_file(&mut builder, name, data);
        }
        builder.finish().unwrap();
    }

    /// Records every call and reports each layer as missing
    #[derive(Default)]
    struct RecordingExtractor {
        calls: RefCell<Vec<PathBuf>>,
    }

    impl Extract for RecordingExtractor {
        fn extract_layer(&self, layer_archive: &Path, _dest_dir: &Path) -> Result<LayerExtraction> {
            self.calls.borrow_mut().push(layer_archive.to_path_buf());
            Ok(LayerExtraction::SkippedMissing {
                path: layer_archive.to_path_buf(),
            })
        }
    }

    #[test]
    fn test_unpack_options_default() {
        let options = UnpackOptions::default();
        assert_eq!(options.layer_suffix, "layer.tar");
        assert!(!options.keep_archives);
    }

    #[test]
    fn test_unpack_extracts_each_layer() {
        let temp_dir = TempDir::new().unwrap();
        let image_path = temp_dir.path().join("image.tar");
        let output = temp_dir.path().join("image");
        write_image(
            &image_path,
            &[
                ("manifest.json", b"[]".to_vec()),
                ("a1/layer.tar", layer_tar_bytes(&[("etc/os-release", "alpine")])),
                ("b2/layer.tar", layer_tar_bytes(&[("usr/bin/app", "binary")])),
            ],
        );

        let summary = ImageUnpacker::new(UnpackOptions::default())
            .unpack(&image_path, &output)
            .unwrap();

        assert_eq!(summary.layers.len(), 2);
        assert_eq!(summary.succeeded(), 2);
        assert_eq!(summary.layers[0].member, "a1/layer.tar");
        assert_eq!(summary.layers[0].layer_dir, output.join("a1"));

        assert_eq!(
            fs::read_to_string(output.join("a1/layer/etc/os-release")).unwrap(),
            "alpine"
        );
        assert!(output.join("b2/layer/usr/bin/app").exists());
        assert!(!output.join("a1/layer.tar").exists());
        assert!(!output.join("manifest.json").exists());
    }

    #[test]
    fn test_unpack_keep_archives() {
        let temp_dir = TempDir::new().unwrap();
        let image_path = temp_dir.path().join("image.tar");
        let output = temp_dir.path().join("image");
        write_image(
            &image_path,
            &[("a1/layer.tar", layer_tar_bytes(&[("hello", "world")]))],
        );

        let options = UnpackOptions {
            keep_archives: true,
            ..UnpackOptions::default()
        };
        let summary = ImageUnpacker::new(options).unpack(&image_path, &output).unwrap();

        match &summary.layers[0].outcome {
            LayerOutcome::Extracted(layer) => assert_eq!(layer.cleanup, Cleanup::Kept),
            other => panic!("Expected Extracted, got: {:?}", other),
        }
        assert!(output.join("a1/layer.tar").exists());
        assert!(output.join("a1/layer/hello").exists());
    }

    #[test]
    fn test_unpack_custom_suffix() {
        let temp_dir = TempDir::new().unwrap();
        let image_path = temp_dir.path().join("image.tar");
        let output = temp_dir.path().join("image");
        write_image(
            &image_path,
            &[
                ("a1/layer.tar", layer_tar_bytes(&[("one", "1")])),
                ("blobs/fs.tar", layer_tar_bytes(&[("two", "2")])),
            ],
        );

        let options = UnpackOptions {
            layer_suffix: "fs.tar".to_string(),
            ..UnpackOptions::default()
        };
        let summary = ImageUnpacker::new(options).unpack(&image_path, &output).unwrap();

        assert_eq!(summary.layers.len(), 1);
        assert!(output.join("blobs/fs/two").exists());
        assert!(!output.join("a1").exists());
    }

    #[test]
    fn test_unpack_hands_each_member_to_extractor() {
        let temp_dir = TempDir::new().unwrap();
        let image_path = temp_dir.path().join("image.tar");
        let output = temp_dir.path().join("image");
        write_image(
            &image_path,
            &[
                ("a1/layer.tar", b"aaaa".to_vec()),
                ("b2/layer.tar", b"bbbbbb".to_vec()),
            ],
        );

        let extractor = RecordingExtractor::default();
        let unpacker = ImageUnpacker::with_extractor(UnpackOptions::default(), extractor);
        let summary = unpacker.unpack(&image_path, &output).unwrap();

        assert_eq!(summary.skipped(), 2);
        assert_eq!(
            *unpacker.extractor.calls.borrow(),
            vec![output.join("a1/layer.tar"), output.join("b2/layer.tar")]
        );
        // Only the member bytes were written, untouched
        assert_eq!(fs::read(output.join("b2/layer.tar")).unwrap(), b"bbbbbb");
    }

    #[test]
    fn test_unpack_rejects_traversal_member() {
        let temp_dir = TempDir::new().unwrap();
        let image_path = temp_dir.path().join("image.tar");
        let output = temp_dir.path().join("out/image");

        let mut builder = Builder::new(File::create(&image_path).unwrap());
        let data = layer_tar_bytes(&[("x", "y")]);
        let mut header = Header::new_gnu();
        let name = b"../evil/layer.tar";
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder.append(&header, &data[..]).unwrap();
        append_file(&mut builder, "good/layer.tar", &layer_tar_bytes(&[("x", "y")]));
        builder.finish().unwrap();

        let summary = ImageUnpacker::new(UnpackOptions::default())
            .unpack(&image_path, &output)
            .unwrap();

        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.succeeded(), 1);
        assert!(summary.layers[0].is_failed());
        assert!(!temp_dir.path().join("out/evil").exists());
        assert!(output.join("good/layer/x").exists());
    }

    #[test]
    fn test_unpack_missing_archive_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("image");

        let result = ImageUnpacker::new(UnpackOptions::default())
            .unpack(&temp_dir.path().join("missing.tar"), &output);

        assert!(matches!(result, Err(UnlayerError::ArchiveOpen { .. })));
    }
}
