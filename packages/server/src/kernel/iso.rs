//! Task ISO builder.
//!
//! Produces a tiny ISO9660 image per job at `<root>/<job_id>/task.iso`
//! carrying the recipe JSON and the status-callback URL for the in-guest
//! dispatcher. The image is built fully in memory (it is a handful of
//! sectors) and written via temp-file + fsync + rename so a rebuild replaces
//! the previous image atomically.
//!
//! All volume and directory timestamps are pinned, and the recipe is
//! serialized canonically, so identical inputs always produce identical
//! bytes.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use uuid::Uuid;

const SECTOR: usize = 2048;

/// Identifier of the recipe file inside the image (mounts as `recipe.json`).
pub const RECIPE_FILE: &str = "RECIPE.JSON;1";
/// Identifier of the callback-URL file (mounts as `callback.url`).
pub const CALLBACK_FILE: &str = "CALLBACK.URL;1";

const VOLUME_ID: &str = "PROVISION_TASK";
// "2000-01-01 00:00:00.00 UTC" in the PVD's a-character form.
const PINNED_VOLUME_DATE: &[u8; 16] = b"2000010100000000";
// Same instant in the 7-byte directory-record form (years since 1900).
const PINNED_DIR_DATE: [u8; 7] = [100, 1, 1, 0, 0, 0, 0];

pub struct IsoBuilder {
    root: PathBuf,
}

impl IsoBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn task_iso_path(&self, job_id: Uuid) -> PathBuf {
        self.root.join(job_id.to_string()).join("task.iso")
    }

    /// Build (or atomically rebuild) the task ISO for a job and return the
    /// absolute path written.
    pub fn build(
        &self,
        job_id: Uuid,
        recipe: &serde_json::Value,
        callback_url: &str,
    ) -> Result<PathBuf> {
        let recipe_bytes =
            serde_json::to_vec(recipe).context("serializing recipe for task ISO")?;
        let callback_bytes = format!("{callback_url}\n").into_bytes();

        // Identifiers must be in sorted order inside the root directory.
        let files = [
            (CALLBACK_FILE, callback_bytes.as_slice()),
            (RECIPE_FILE, recipe_bytes.as_slice()),
        ];
        let image = write_image(&files);

        let dest = self.task_iso_path(job_id);
        let dir = dest
            .parent()
            .context("task ISO path has no parent directory")?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating {}", dir.display()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("creating temp file in {}", dir.display()))?;
        tmp.write_all(&image).context("writing task ISO")?;
        tmp.flush()?;
        tmp.as_file().sync_all().context("syncing task ISO")?;
        tmp.persist(&dest)
            .with_context(|| format!("replacing {}", dest.display()))?;

        let dest = dest
            .canonicalize()
            .unwrap_or(dest);
        Ok(dest)
    }

    /// Best-effort removal of a job's media directory.
    pub fn remove(&self, job_id: Uuid) -> std::io::Result<()> {
        let dir = self.root.join(job_id.to_string());
        match std::fs::remove_dir_all(&dir) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// Lay out the image: 16 blank system sectors, PVD, terminator, both path
/// tables, one root-directory sector, then the file extents.
fn write_image(files: &[(&str, &[u8])]) -> Vec<u8> {
    const PVD_SECTOR: u32 = 16;
    const PATH_TABLE_L_SECTOR: u32 = 18;
    const PATH_TABLE_M_SECTOR: u32 = 19;
    const ROOT_DIR_SECTOR: u32 = 20;
    const FIRST_FILE_SECTOR: u32 = 21;

    let mut extents = Vec::with_capacity(files.len());
    let mut next = FIRST_FILE_SECTOR;
    for (name, data) in files {
        extents.push((*name, *data, next));
        next += sectors(data.len()) as u32;
    }
    let total_sectors = next;

    let mut image = vec![0u8; total_sectors as usize * SECTOR];

    // Primary volume descriptor.
    {
        let pvd = &mut image[PVD_SECTOR as usize * SECTOR..(PVD_SECTOR as usize + 1) * SECTOR];
        pvd[0] = 1; // type: primary
        pvd[1..6].copy_from_slice(b"CD001");
        pvd[6] = 1; // version
        fill_a_chars(&mut pvd[8..40], ""); // system identifier
        fill_a_chars(&mut pvd[40..72], VOLUME_ID);
        pvd[80..88].copy_from_slice(&both_u32(total_sectors));
        pvd[120..124].copy_from_slice(&both_u16(1)); // volume set size
        pvd[124..128].copy_from_slice(&both_u16(1)); // volume sequence number
        pvd[128..132].copy_from_slice(&both_u16(SECTOR as u16));
        let path_table = path_table_entry(ROOT_DIR_SECTOR);
        pvd[132..140].copy_from_slice(&both_u32(path_table.len() as u32));
        pvd[140..144].copy_from_slice(&PATH_TABLE_L_SECTOR.to_le_bytes());
        pvd[148..152].copy_from_slice(&PATH_TABLE_M_SECTOR.to_be_bytes());
        let root = dir_record(&[0u8], ROOT_DIR_SECTOR, SECTOR as u32, true);
        pvd[156..156 + root.len()].copy_from_slice(&root);
        fill_a_chars(&mut pvd[190..318], ""); // volume set identifier
        fill_a_chars(&mut pvd[318..446], ""); // publisher
        fill_a_chars(&mut pvd[446..574], ""); // data preparer
        fill_a_chars(&mut pvd[574..702], "PROVISIONING CONTROLLER");
        fill_a_chars(&mut pvd[702..739], "");
        fill_a_chars(&mut pvd[739..776], "");
        fill_a_chars(&mut pvd[776..813], "");
        pvd[813..829].copy_from_slice(PINNED_VOLUME_DATE); // creation
        pvd[830..846].copy_from_slice(PINNED_VOLUME_DATE); // modification
        pvd[847..863].copy_from_slice(b"0000000000000000"); // expiration: none
        pvd[864..880].copy_from_slice(b"0000000000000000"); // effective: none
        pvd[881] = 1; // file structure version
    }

    // Volume descriptor set terminator.
    {
        let term = &mut image[17 * SECTOR..18 * SECTOR];
        term[0] = 255;
        term[1..6].copy_from_slice(b"CD001");
        term[6] = 1;
    }

    // Path tables, little- and big-endian flavors of the single root entry.
    {
        let entry = path_table_entry(ROOT_DIR_SECTOR);
        let start = PATH_TABLE_L_SECTOR as usize * SECTOR;
        image[start..start + entry.len()].copy_from_slice(&entry);

        let mut entry_m = entry.clone();
        entry_m[2..6].copy_from_slice(&ROOT_DIR_SECTOR.to_be_bytes());
        let start = PATH_TABLE_M_SECTOR as usize * SECTOR;
        image[start..start + entry_m.len()].copy_from_slice(&entry_m);
    }

    // Root directory extent: ".", "..", then the files.
    {
        let mut offset = ROOT_DIR_SECTOR as usize * SECTOR;
        for record in [
            dir_record(&[0u8], ROOT_DIR_SECTOR, SECTOR as u32, true),
            dir_record(&[1u8], ROOT_DIR_SECTOR, SECTOR as u32, true),
        ] {
            image[offset..offset + record.len()].copy_from_slice(&record);
            offset += record.len();
        }
        for (name, data, sector) in &extents {
            let record = dir_record(name.as_bytes(), *sector, data.len() as u32, false);
            image[offset..offset + record.len()].copy_from_slice(&record);
            offset += record.len();
        }
    }

    // File extents.
    for (_, data, sector) in &extents {
        let start = *sector as usize * SECTOR;
        image[start..start + data.len()].copy_from_slice(data);
    }

    image
}

fn sectors(len: usize) -> usize {
    len.div_ceil(SECTOR).max(1)
}

/// A directory record per ECMA-119 9.1, padded to even length.
fn dir_record(identifier: &[u8], extent: u32, size: u32, is_dir: bool) -> Vec<u8> {
    let mut len = 33 + identifier.len();
    if len % 2 != 0 {
        len += 1;
    }

    let mut record = vec![0u8; len];
    record[0] = len as u8;
    record[2..10].copy_from_slice(&both_u32(extent));
    record[10..18].copy_from_slice(&both_u32(size));
    record[18..25].copy_from_slice(&PINNED_DIR_DATE);
    record[25] = if is_dir { 0x02 } else { 0x00 };
    record[28..32].copy_from_slice(&both_u16(1)); // volume sequence number
    record[32] = identifier.len() as u8;
    record[33..33 + identifier.len()].copy_from_slice(identifier);
    record
}

/// The single root entry shared by both path tables (little-endian flavor).
fn path_table_entry(root_sector: u32) -> Vec<u8> {
    let mut entry = vec![0u8; 10];
    entry[0] = 1; // identifier length
    entry[2..6].copy_from_slice(&root_sector.to_le_bytes());
    entry[6..8].copy_from_slice(&1u16.to_le_bytes()); // parent: root itself
    // identifier 0x00 and one pad byte are already zero
    entry
}

fn both_u32(v: u32) -> [u8; 8] {
    let mut b = [0u8; 8];
    b[..4].copy_from_slice(&v.to_le_bytes());
    b[4..].copy_from_slice(&v.to_be_bytes());
    b
}

fn both_u16(v: u16) -> [u8; 4] {
    let mut b = [0u8; 4];
    b[..2].copy_from_slice(&v.to_le_bytes());
    b[2..].copy_from_slice(&v.to_be_bytes());
    b
}

fn fill_a_chars(buf: &mut [u8], value: &str) {
    buf.fill(b' ');
    let bytes = value.as_bytes();
    let n = bytes.len().min(buf.len());
    buf[..n].copy_from_slice(&bytes[..n]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_recipe() -> serde_json::Value {
        serde_json::json!({
            "task_target": "install-linux.target",
            "target_disk": "/dev/sda"
        })
    }

    /// Walk the root directory and return (extent, size) for an identifier.
    fn find_file(image: &[u8], identifier: &str) -> Option<(usize, usize)> {
        let mut offset = 20 * SECTOR;
        loop {
            let len = image[offset] as usize;
            if len == 0 {
                return None;
            }
            let id_len = image[offset + 32] as usize;
            let id = &image[offset + 33..offset + 33 + id_len];
            if id == identifier.as_bytes() {
                let extent =
                    u32::from_le_bytes(image[offset + 2..offset + 6].try_into().unwrap()) as usize;
                let size =
                    u32::from_le_bytes(image[offset + 10..offset + 14].try_into().unwrap()) as usize;
                return Some((extent, size));
            }
            offset += len;
        }
    }

    #[test]
    fn image_has_primary_volume_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let builder = IsoBuilder::new(dir.path());
        let job_id = Uuid::new_v4();

        let path = builder
            .build(job_id, &sample_recipe(), "http://ctl/api/v1/status-webhook/SER-1")
            .unwrap();
        let image = std::fs::read(path).unwrap();

        assert_eq!(&image[16 * SECTOR + 1..16 * SECTOR + 6], b"CD001");
        assert_eq!(image[16 * SECTOR], 1);
        assert_eq!(image[17 * SECTOR], 255);
        assert_eq!(image.len() % SECTOR, 0);
    }

    #[test]
    fn recipe_and_callback_are_discoverable() {
        let dir = tempfile::tempdir().unwrap();
        let builder = IsoBuilder::new(dir.path());
        let recipe = sample_recipe();
        let callback = "http://ctl/api/v1/status-webhook/SER-1";

        let path = builder.build(Uuid::new_v4(), &recipe, callback).unwrap();
        let image = std::fs::read(path).unwrap();

        let (extent, size) = find_file(&image, RECIPE_FILE).expect("recipe file present");
        let stored: serde_json::Value =
            serde_json::from_slice(&image[extent * SECTOR..extent * SECTOR + size]).unwrap();
        assert_eq!(stored, recipe);

        let (extent, size) = find_file(&image, CALLBACK_FILE).expect("callback file present");
        let stored = std::str::from_utf8(&image[extent * SECTOR..extent * SECTOR + size]).unwrap();
        assert_eq!(stored.trim_end(), callback);
    }

    #[test]
    fn identical_inputs_produce_identical_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let builder = IsoBuilder::new(dir.path());
        let job_a = Uuid::new_v4();
        let job_b = Uuid::new_v4();

        let a = builder
            .build(job_a, &sample_recipe(), "http://ctl/cb")
            .unwrap();
        let b = builder
            .build(job_b, &sample_recipe(), "http://ctl/cb")
            .unwrap();

        assert_eq!(std::fs::read(a).unwrap(), std::fs::read(b).unwrap());
    }

    #[test]
    fn rebuild_replaces_existing_image() {
        let dir = tempfile::tempdir().unwrap();
        let builder = IsoBuilder::new(dir.path());
        let job_id = Uuid::new_v4();

        let first = builder
            .build(job_id, &sample_recipe(), "http://ctl/cb")
            .unwrap();
        let mut other = sample_recipe();
        other["target_disk"] = "/dev/nvme0n1".into();
        let second = builder.build(job_id, &other, "http://ctl/cb").unwrap();

        assert_eq!(first, second);
        let image = std::fs::read(second).unwrap();
        let (extent, size) = find_file(&image, RECIPE_FILE).unwrap();
        let stored: serde_json::Value =
            serde_json::from_slice(&image[extent * SECTOR..extent * SECTOR + size]).unwrap();
        assert_eq!(stored["target_disk"], "/dev/nvme0n1");
    }

    #[test]
    fn large_recipe_spans_multiple_sectors() {
        let dir = tempfile::tempdir().unwrap();
        let builder = IsoBuilder::new(dir.path());
        let mut recipe = sample_recipe();
        recipe["notes"] = "n".repeat(1900).into();

        let path = builder.build(Uuid::new_v4(), &recipe, "http://ctl/cb").unwrap();
        let image = std::fs::read(path).unwrap();

        let (extent, size) = find_file(&image, RECIPE_FILE).unwrap();
        assert!(size > SECTOR);
        let stored: serde_json::Value =
            serde_json::from_slice(&image[extent * SECTOR..extent * SECTOR + size]).unwrap();
        assert_eq!(stored, recipe);
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let builder = IsoBuilder::new(dir.path());
        let job_id = Uuid::new_v4();

        let path = builder.build(job_id, &sample_recipe(), "http://ctl/cb").unwrap();
        assert!(path.exists());

        builder.remove(job_id).unwrap();
        assert!(!path.exists());
        builder.remove(job_id).unwrap();
    }
}
