//! Summary files: the per-checkpoint manifest written next to flushed files
//! on the parallel file system.
//!
//! The current format (version 5) is a serialized tree. Versions 1 through
//! 4 were tab-separated text with one row per file; they are read-only and
//! upconverted in memory so the fetch path only ever sees version 5.

use std::io::BufRead;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::index::Index;
use crate::kvtree::Kvtree;

/// Current summary format version.
pub const SUMMARY_VERSION: u64 = 5;

/// Name of the version-5 summary file inside a checkpoint directory.
pub const SUMMARY_FILE: &str = "summary.scr";
/// Name of the legacy text summary file.
pub const SUMMARY_FILE_V4: &str = "scr_summary.txt";

pub(crate) const KEY_VERSION: &str = "VERSION";
pub(crate) const KEY_CKPT: &str = "CKPT";
pub(crate) const KEY_RANKS: &str = "RANKS";
pub(crate) const KEY_COMPLETE: &str = "COMPLETE";
pub(crate) const KEY_RANK: &str = "RANK";
pub(crate) const KEY_FILE: &str = "FILE";
pub(crate) const KEY_SIZE: &str = "SIZE";
pub(crate) const KEY_CRC: &str = "CRC";
pub(crate) const KEY_NOFETCH: &str = "NOFETCH";

/// Write the summary for `checkpoint_id` into `dir` and mark the
/// checkpoint's completeness in the index file under `prefix`. `data` holds
/// the gathered per-rank subtrees (`RANK -> r -> FILE -> ...`).
pub(crate) fn write(
    prefix: &Path,
    dir: &Path,
    checkpoint_id: u64,
    all_complete: bool,
    ranks_world: usize,
    data: &Kvtree,
) -> Result<()> {
    let mut summary = Kvtree::new();
    summary.set_u64(KEY_VERSION, SUMMARY_VERSION);
    let ckpt = summary.set_kv_int(KEY_CKPT, checkpoint_id);
    ckpt.set_u64(KEY_RANKS, ranks_world as u64);
    ckpt.merge(data);
    ckpt.set_u64(KEY_COMPLETE, all_complete as u64);
    summary.write_file(&dir.join(SUMMARY_FILE))?;

    let subdir = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut index = Index::read(prefix)?;
    index.set_complete(checkpoint_id, &subdir, all_complete);
    index.write(prefix)?;
    Ok(())
}

/// Read the summary in `dir`, trying version 5 and falling back to the
/// legacy text format. Validates the version, that exactly one checkpoint
/// is present and complete, and that it was written by `ranks_world` ranks.
/// Returns the upconverted tree and the checkpoint id.
pub(crate) fn read(dir: &Path, ranks_world: usize) -> Result<(Kvtree, u64)> {
    let v5_path = dir.join(SUMMARY_FILE);
    let summary = if v5_path.exists() {
        Kvtree::read_file(&v5_path)?
    } else {
        read_v4(&dir.join(SUMMARY_FILE_V4), ranks_world)?
    };

    let fail = |reason: &str| Error::Corrupt {
        path: dir.to_owned(),
        reason: reason.to_owned(),
    };

    if summary.get_u64(KEY_VERSION) != Some(SUMMARY_VERSION) {
        return Err(fail("summary file version is not supported"));
    }
    let ckpts = summary.get(KEY_CKPT).ok_or_else(|| fail("no checkpoint in summary"))?;
    if ckpts.len() != 1 {
        return Err(fail("expected exactly one checkpoint in summary"));
    }
    let id_str = ckpts.first_key().unwrap().to_owned();
    let id: u64 = id_str
        .parse()
        .map_err(|_| fail("bad checkpoint id in summary"))?;
    let ckpt = ckpts.get(&id_str).unwrap();

    if ckpt.get_u64(KEY_COMPLETE) != Some(1) {
        return Err(fail("checkpoint is not marked complete"));
    }
    let ranks = ckpt
        .get_u64(KEY_RANKS)
        .ok_or_else(|| fail("summary is missing rank count"))?;
    if ranks as usize != ranks_world {
        return Err(fail(&format!(
            "checkpoint was written by {} ranks but the job has {}",
            ranks, ranks_world
        )));
    }
    Ok((summary, id))
}

/// Parse a legacy text summary and upconvert it to the version-5 tree.
fn read_v4(path: &Path, ranks_world: usize) -> Result<Kvtree> {
    let file = std::fs::File::open(path)?;
    let mut lines = std::io::BufReader::new(file).lines();

    let corrupt = |reason: String| Error::Corrupt {
        path: path.to_owned(),
        reason,
    };

    let mut next_line = || -> Result<String> {
        lines
            .next()
            .transpose()?
            .ok_or_else(|| corrupt("early end of file".into()))
    };

    // Header: "Version: N" on the first line for v2+; v1 starts straight
    // into data rows.
    let first = next_line()?;
    let mut version = 1u32;
    let mut num_records = ranks_world;
    let mut pending_record: Option<String> = None;
    if let Some(rest) = first.strip_prefix("Version:") {
        version = rest
            .trim()
            .parse()
            .map_err(|_| corrupt("bad version header".into()))?;
    } else {
        pending_record = Some(first);
    }
    if version >= 3 {
        // "Rows: N" then a column-label line.
        let rows_line = next_line()?;
        let count = rows_line
            .split_whitespace()
            .nth(1)
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| corrupt("bad row-count header".into()))?;
        num_records = count;
        next_line()?;
    } else if version == 2 {
        next_line()?;
    }
    if num_records == 0 {
        return Err(corrupt("no file records found".into()));
    }

    let mut summary = Kvtree::new();
    summary.set_u64(KEY_VERSION, SUMMARY_VERSION);

    let mut all_complete = true;
    let mut all_ranks: Option<u64> = None;
    let mut all_ckpt: Option<u64> = None;

    for i in 0..num_records {
        let line = match pending_record.take() {
            Some(l) => l,
            None => next_line().map_err(|_| {
                corrupt(format!(
                    "early end of file, read {} of {} records",
                    i, num_records
                ))
            })?,
        };
        let fields: Vec<&str> = line.split_whitespace().collect();
        let rec = Record::parse(version, &fields)
            .ok_or_else(|| corrupt(format!("invalid record on row {}", i + 1)))?;

        if rec.rank as usize >= ranks_world {
            return Err(corrupt(format!(
                "invalid rank {} in a job with {} tasks",
                rec.rank, ranks_world
            )));
        }
        // Every row must agree on the checkpoint id and rank count.
        match all_ckpt {
            None => all_ckpt = Some(rec.ckpt),
            Some(c) if c == rec.ckpt => {}
            Some(c) => {
                return Err(corrupt(format!(
                    "checkpoint id {} does not match expected {}",
                    rec.ckpt, c
                )))
            }
        }
        match all_ranks {
            None => all_ranks = Some(rec.ranks),
            Some(r) if r == rec.ranks => {}
            Some(r) => {
                return Err(corrupt(format!(
                    "rank count {} does not match expected {}",
                    rec.ranks, r
                )))
            }
        }
        if !rec.complete {
            all_complete = false;
        }

        let base = Path::new(&rec.filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| corrupt(format!("bad filename on row {}", i + 1)))?;
        let file_hash = summary
            .set_kv_int(KEY_CKPT, rec.ckpt)
            .set_kv_int(KEY_RANK, rec.rank)
            .set_kv(KEY_FILE, &base);
        file_hash.set_u64(KEY_SIZE, rec.exp_size);
        if let Some(crc) = rec.crc {
            file_hash.set_u64(KEY_CRC, crc as u64);
        }
        if !rec.complete {
            file_hash.set_u64(KEY_COMPLETE, 0);
        }
    }

    let ckpt_id = all_ckpt.expect("at least one record");
    let ckpt = summary.set_kv_int(KEY_CKPT, ckpt_id);
    ckpt.set_u64(KEY_COMPLETE, all_complete as u64);
    ckpt.set_u64(KEY_RANKS, all_ranks.expect("at least one record"));
    Ok(summary)
}

struct Record {
    rank: u64,
    ranks: u64,
    ckpt: u64,
    complete: bool,
    exp_size: u64,
    filename: String,
    crc: Option<u32>,
}

impl Record {
    fn parse(version: u32, fields: &[&str]) -> Option<Record> {
        if version == 1 {
            // rank scr ranks pattern ckpt complete exp_size match size file
            if fields.len() != 10 {
                return None;
            }
            Some(Record {
                rank: fields[0].parse().ok()?,
                ranks: fields[2].parse().ok()?,
                ckpt: fields[4].parse().ok()?,
                complete: fields[5].parse::<u64>().ok()? != 0,
                exp_size: fields[6].parse().ok()?,
                filename: fields[9].to_string(),
                crc: None,
            })
        } else {
            // rank scr ranks ckpt complete exp_size match size file
            // crc_computed 0xCRC
            if fields.len() != 11 {
                return None;
            }
            let crc_computed = fields[9].parse::<u64>().ok()? != 0;
            let crc = if crc_computed {
                Some(u32::from_str_radix(fields[10].trim_start_matches("0x"), 16).ok()?)
            } else {
                None
            };
            Some(Record {
                rank: fields[0].parse().ok()?,
                ranks: fields[2].parse().ok()?,
                ckpt: fields[3].parse().ok()?,
                complete: fields[4].parse::<u64>().ok()? != 0,
                exp_size: fields[5].parse().ok()?,
                filename: fields[8].to_string(),
                crc,
            })
        }
    }
}

/// Per-rank subtree for `rank` inside an upconverted summary, if present.
pub(crate) fn rank_subtree(summary: &Kvtree, checkpoint_id: u64, rank: usize) -> Option<&Kvtree> {
    summary
        .get_kv_int(KEY_CKPT, checkpoint_id)?
        .get_kv_int(KEY_RANK, rank as u64)
}

/// Path of the version-5 summary inside `dir`.
pub fn summary_path(dir: &Path) -> PathBuf {
    dir.join(SUMMARY_FILE)
}
