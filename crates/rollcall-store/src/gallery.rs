//! CSV-backed embedding gallery.
//!
//! Layout: one row per enrolled record, `identity,e0,e1,…,e(L-1)`. The
//! number of `e*` columns is whatever the first enrolled embedding had;
//! after that the store refuses any other length.

use crate::error::StoreError;
use crate::persist::{self, FileLock};
use crate::schema;
use rollcall_core::{validation, Embedding, Gallery};
use std::path::{Path, PathBuf};

/// Durable gallery handle. Owns its backing file exclusively.
pub struct GalleryStore {
    path: PathBuf,
    default_dimension: Option<usize>,
    gallery: Gallery,
}

impl GalleryStore {
    /// Load the gallery at `path`, or start empty if the file does not exist.
    ///
    /// `default_dimension` applies only while the gallery has no records and
    /// the file declares no component columns.
    pub fn load(path: impl Into<PathBuf>, default_dimension: Option<usize>) -> Result<Self, StoreError> {
        let path = path.into();
        let gallery = read_gallery(&path, default_dimension)?
            .unwrap_or_else(|| Gallery::with_dimension(default_dimension));

        tracing::info!(
            path = %path.display(),
            records = gallery.len(),
            dimension = ?gallery.dimension(),
            "gallery loaded"
        );

        Ok(Self {
            path,
            default_dimension,
            gallery,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current in-memory snapshot.
    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    /// Validate and append a record, then rewrite the file before returning.
    ///
    /// All-or-nothing: on any error neither memory nor disk changes.
    pub fn enroll(&mut self, identity: &str, embedding: Embedding) -> Result<(), StoreError> {
        // Dimension is checked against the on-disk state, under the lock.
        validation::normalize_identity(identity)?;
        validation::check_components(&embedding.values)?;

        let _lock = FileLock::acquire(&self.path)?;
        self.sync_from_disk()?;

        let mut next = self.gallery.clone();
        let dimension = embedding.dimension();
        let identity = next.push(identity, embedding)?;
        persist::write_atomic(&self.path, &encode_gallery(&next)?)?;
        self.gallery = next;

        tracing::info!(
            identity = %identity,
            dimension,
            records = self.gallery.len(),
            "enrolled embedding"
        );
        Ok(())
    }

    /// Remove every record and unlock the dimensionality. Returns how many
    /// records were dropped.
    ///
    /// Does not read the existing file, so it also recovers a corrupt store.
    pub fn clear(&mut self) -> Result<usize, StoreError> {
        let _lock = FileLock::acquire(&self.path)?;
        let removed = self.gallery.len();
        let empty = Gallery::with_dimension(self.default_dimension);
        persist::write_atomic(&self.path, &encode_gallery(&empty)?)?;
        self.gallery = empty;

        tracing::warn!(path = %self.path.display(), removed, "gallery cleared");
        Ok(removed)
    }

    /// Adopt rows another process may have written since we loaded.
    fn sync_from_disk(&mut self) -> Result<(), StoreError> {
        let on_disk = read_gallery(&self.path, self.default_dimension)?
            .unwrap_or_else(|| Gallery::with_dimension(self.default_dimension));
        if on_disk != self.gallery {
            tracing::debug!(
                cached = self.gallery.len(),
                on_disk = on_disk.len(),
                "gallery changed on disk; adopting file state"
            );
            self.gallery = on_disk;
        }
        Ok(())
    }
}

/// Read and validate a gallery file; `Ok(None)` if it does not exist.
pub fn read_gallery(path: &Path, default_dimension: Option<usize>) -> Result<Option<Gallery>, StoreError> {
    match persist::read_optional(path)? {
        Some(bytes) => decode_gallery(path, &bytes, default_dimension)
            .inspect_err(|e| tracing::warn!(error = %e, "gallery store is corrupt"))
            .map(Some),
        None => Ok(None),
    }
}

fn decode_gallery(path: &Path, bytes: &[u8], default_dimension: Option<usize>) -> Result<Gallery, StoreError> {
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(Gallery::with_dimension(default_dimension));
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);

    let header = reader
        .headers()
        .map_err(|e| StoreError::corrupt(path, 1, e.to_string()))?
        .clone();
    let declared = schema::parse_gallery_header(&header).map_err(|reason| StoreError::corrupt(path, 1, reason))?;
    let dimension = if declared > 0 { Some(declared) } else { default_dimension };

    let mut gallery = Gallery::with_dimension(dimension);
    for row in reader.records() {
        let row = row.map_err(|e| {
            let line = e.position().map(|p| p.line()).unwrap_or(0);
            StoreError::corrupt(path, line, e.to_string())
        })?;
        let line = row.position().map(|p| p.line()).unwrap_or(0);

        if row.len() != header.len() {
            return Err(StoreError::corrupt(
                path,
                line,
                format!("expected {} fields, found {}", header.len(), row.len()),
            ));
        }

        let identity = row.get(0).unwrap_or_default();
        let values = row
            .iter()
            .skip(1)
            .enumerate()
            .map(|(i, raw)| {
                raw.trim().parse::<f64>().map_err(|_| {
                    StoreError::corrupt(
                        path,
                        line,
                        format!("{}: '{raw}' is not a number", schema::component_column(i)),
                    )
                })
            })
            .collect::<Result<Vec<f64>, StoreError>>()?;

        gallery
            .push(identity, Embedding::new(values))
            .map_err(|e| StoreError::corrupt(path, line, e.to_string()))?;
    }

    Ok(gallery)
}

fn encode_gallery(gallery: &Gallery) -> Result<Vec<u8>, StoreError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(schema::gallery_header(gallery.dimension()))?;
    for record in gallery.records() {
        let mut row = Vec::with_capacity(1 + record.embedding.dimension());
        row.push(record.identity.clone());
        row.extend(record.embedding.values.iter().map(|v| v.to_string()));
        writer.write_record(&row)?;
    }
    writer
        .into_inner()
        .map_err(|e| StoreError::Csv(csv::Error::from(e.into_error())))
}
