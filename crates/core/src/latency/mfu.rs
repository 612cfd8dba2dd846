//! MFU (model FLOPs utilization) lookup tables.
//!
//! Three read-only tables loaded from CSV files under
//! `bench_data/{gemm|mha/prefill|mha/decode}/<gpu>/`:
//!
//! - `gemm/<gpu>/*.csv` with columns `m,k,n,mfu`;
//! - `mha/prefill/<gpu>/*.csv` with columns
//!   `num_heads,num_kv_heads,head_dim,seq_len,mfu`;
//! - `mha/decode/<gpu>/*_tp<N>.csv` with columns
//!   `num_heads,num_kv_heads,head_dim,batch_size,kv_len,mfu`; the
//!   tensor-parallel degree is encoded in the filename.
//!
//! Lookup policy: exact match wins; ordered axes (sequence length, batch
//! size, KV length, GEMM M) resolve by floor-preferring nearest neighbor
//! (largest benchmarked key at or below the query, else the smallest key
//! above it); the unordered attention-config space resolves by Euclidean
//! nearest. A zero or absent cell is replaced by the nearest non-zero value
//! over the whole table, never by insertion order.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// `(num_heads, num_kv_heads, head_dim)`.
pub type AttnKey = (u64, u64, u64);

#[derive(Debug, thiserror::Error)]
pub enum MfuError {
    #[error("bench data directory {0} does not exist")]
    MissingDir(PathBuf),

    #[error("no usable csv files under {0}")]
    EmptyTable(PathBuf),

    #[error("{path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("{path}: cannot infer tensor-parallel degree from filename")]
    MissingTpSuffix { path: PathBuf },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Deserialize)]
struct GemmRow {
    m: u64,
    k: u64,
    n: u64,
    mfu: f64,
}

#[derive(Debug, Deserialize)]
struct PrefillRow {
    num_heads: u64,
    num_kv_heads: u64,
    head_dim: u64,
    seq_len: u64,
    mfu: f64,
}

#[derive(Debug, Deserialize)]
struct DecodeRow {
    num_heads: u64,
    num_kv_heads: u64,
    head_dim: u64,
    batch_size: u64,
    kv_len: u64,
    mfu: f64,
}

/// The three benchmark tables for one GPU. Immutable once loaded.
#[derive(Clone, Debug, Default)]
pub struct MfuDb {
    /// `(k, n) -> m -> mfu`.
    gemm: BTreeMap<(u64, u64), BTreeMap<u64, f64>>,
    /// `attn -> seq_len -> mfu`.
    prefill: BTreeMap<AttnKey, BTreeMap<u64, f64>>,
    /// `tp -> attn -> (batch, kv_len) -> mfu`.
    decode: BTreeMap<u64, BTreeMap<AttnKey, BTreeMap<(u64, u64), f64>>>,
}

impl MfuDb {
    pub fn load(bench_root: &Path, gpu: &str) -> Result<Self, MfuError> {
        let mut db = MfuDb::default();

        let gemm_dir = bench_root.join("gemm").join(gpu);
        for path in csv_files(&gemm_dir)? {
            for row in read_rows::<GemmRow>(&path)? {
                db.gemm
                    .entry((row.k, row.n))
                    .or_default()
                    .insert(row.m, row.mfu);
            }
        }
        if db.gemm.is_empty() {
            return Err(MfuError::EmptyTable(gemm_dir));
        }

        let prefill_dir = bench_root.join("mha").join("prefill").join(gpu);
        for path in csv_files(&prefill_dir)? {
            for row in read_rows::<PrefillRow>(&path)? {
                db.prefill
                    .entry((row.num_heads, row.num_kv_heads, row.head_dim))
                    .or_default()
                    .insert(row.seq_len, row.mfu);
            }
        }
        if db.prefill.is_empty() {
            return Err(MfuError::EmptyTable(prefill_dir));
        }

        let decode_dir = bench_root.join("mha").join("decode").join(gpu);
        for path in csv_files(&decode_dir)? {
            let tp = parse_tp(&path)?;
            for row in read_rows::<DecodeRow>(&path)? {
                db.decode
                    .entry(tp)
                    .or_default()
                    .entry((row.num_heads, row.num_kv_heads, row.head_dim))
                    .or_default()
                    .insert((row.batch_size, row.kv_len), row.mfu);
            }
        }
        if db.decode.is_empty() {
            return Err(MfuError::EmptyTable(decode_dir));
        }

        Ok(db)
    }

    /// In-memory construction for tests and synthetic sweeps.
    pub fn from_tables(
        gemm: BTreeMap<(u64, u64), BTreeMap<u64, f64>>,
        prefill: BTreeMap<AttnKey, BTreeMap<u64, f64>>,
        decode: BTreeMap<u64, BTreeMap<AttnKey, BTreeMap<(u64, u64), f64>>>,
    ) -> Self {
        Self {
            gemm,
            prefill,
            decode,
        }
    }

    /// Whether the decode table covers the given tensor-parallel degree.
    pub fn has_tp(&self, tp: u64) -> bool {
        self.decode.contains_key(&tp)
    }

    /// GEMM MFU at `(m, k, n)`.
    pub fn gemm(&self, m: u64, k: u64, n: u64) -> f64 {
        // (k, n) resolves by Euclidean nearest among benchmarked shapes,
        // then m by floor-preferring nearest within that shape.
        let shape = nearest_euclidean_2d(self.gemm.keys(), (k, n))
            .expect("gemm table validated non-empty at load");
        let by_m = &self.gemm[&shape];
        let m_key = floor_preferring(by_m.keys().copied(), m).expect("non-empty m axis");
        let value = by_m[&m_key];
        if value > 0.0 {
            return value;
        }
        nearest_nonzero_1d(by_m, m).unwrap_or(fallback_nonzero(
            self.gemm.values().flat_map(|t| t.values().copied()),
        ))
    }

    /// Attention prefill MFU for an attention config and sequence length.
    pub fn prefill(&self, attn: AttnKey, seq_len: u64) -> f64 {
        let key = nearest_euclidean_3d(self.prefill.keys(), attn)
            .expect("prefill table validated non-empty at load");
        let by_seq = &self.prefill[&key];
        let seq_key = floor_preferring(by_seq.keys().copied(), seq_len).expect("non-empty seq axis");
        let value = by_seq[&seq_key];
        if value > 0.0 {
            return value;
        }
        nearest_nonzero_1d(by_seq, seq_len).unwrap_or(fallback_nonzero(
            self.prefill.values().flat_map(|t| t.values().copied()),
        ))
    }

    /// Attention decode MFU for a TP degree, attention config, batch size
    /// and KV length.
    pub fn decode(&self, tp: u64, attn: AttnKey, batch: u64, kv_len: u64) -> f64 {
        let by_tp = match self.decode.get(&tp) {
            Some(t) => t,
            // Constructor validation makes this unreachable in simulation;
            // fall back to the closest benchmarked degree for ad-hoc use.
            None => {
                let tp_key = floor_preferring(self.decode.keys().copied(), tp)
                    .expect("decode table validated non-empty at load");
                &self.decode[&tp_key]
            }
        };
        let key = nearest_euclidean_3d(by_tp.keys(), attn).expect("non-empty attn axis");
        let cells = &by_tp[&key];

        // Floor-prefer on batch, then on kv within the chosen batch row.
        let batch_key = floor_preferring(
            cells.keys().map(|(b, _)| *b),
            batch,
        )
        .expect("non-empty batch axis");
        let kv_key = floor_preferring(
            cells
                .keys()
                .filter(|(b, _)| *b == batch_key)
                .map(|(_, kv)| *kv),
            kv_len,
        )
        .expect("non-empty kv axis");
        let value = cells[&(batch_key, kv_key)];
        if value > 0.0 {
            return value;
        }
        // Benchmarks contain genuine zeros at tiny (batch, kv) corners;
        // substitute the nearest non-zero cell of the same attention config.
        nearest_nonzero_2d(cells, (batch, kv_len)).unwrap_or(fallback_nonzero(
            by_tp.values().flat_map(|t| t.values().copied()),
        ))
    }
}

fn csv_files(dir: &Path) -> Result<Vec<PathBuf>, MfuError> {
    if !dir.is_dir() {
        return Err(MfuError::MissingDir(dir.to_path_buf()));
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "csv"))
        .collect();
    // Directory iteration order is OS-dependent; sort for determinism.
    files.sort();
    if files.is_empty() {
        return Err(MfuError::EmptyTable(dir.to_path_buf()));
    }
    Ok(files)
}

fn read_rows<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, MfuError> {
    let mut reader = csv::Reader::from_path(path).map_err(|source| MfuError::Csv {
        path: path.to_path_buf(),
        source,
    })?;
    reader
        .deserialize()
        .collect::<Result<Vec<T>, csv::Error>>()
        .map_err(|source| MfuError::Csv {
            path: path.to_path_buf(),
            source,
        })
}

/// Extract the TP degree from a decode filename like `decode_tp2.csv`.
fn parse_tp(path: &Path) -> Result<u64, MfuError> {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    stem.rsplit("tp")
        .next()
        .and_then(|suffix| suffix.parse().ok())
        .ok_or_else(|| MfuError::MissingTpSuffix {
            path: path.to_path_buf(),
        })
}

/// Largest key at or below `query`, else the smallest key above it.
fn floor_preferring(keys: impl Iterator<Item = u64>, query: u64) -> Option<u64> {
    let mut floor: Option<u64> = None;
    let mut ceil: Option<u64> = None;
    for key in keys {
        if key <= query {
            floor = Some(floor.map_or(key, |f| f.max(key)));
        } else {
            ceil = Some(ceil.map_or(key, |c| c.min(key)));
        }
    }
    floor.or(ceil)
}

fn nearest_euclidean_2d<'a>(
    keys: impl Iterator<Item = &'a (u64, u64)>,
    query: (u64, u64),
) -> Option<(u64, u64)> {
    keys.copied()
        .min_by_key(|key| (sq_dist(key.0, query.0) + sq_dist(key.1, query.1), *key))
}

fn nearest_euclidean_3d<'a>(
    keys: impl Iterator<Item = &'a AttnKey>,
    query: AttnKey,
) -> Option<AttnKey> {
    keys.copied().min_by_key(|key| {
        (
            sq_dist(key.0, query.0) + sq_dist(key.1, query.1) + sq_dist(key.2, query.2),
            *key,
        )
    })
}

fn sq_dist(a: u64, b: u64) -> u128 {
    let d = a.abs_diff(b) as u128;
    d * d
}

fn nearest_nonzero_1d(table: &BTreeMap<u64, f64>, query: u64) -> Option<f64> {
    table
        .iter()
        .filter(|(_, v)| **v > 0.0)
        .min_by_key(|(k, _)| (k.abs_diff(query), **k))
        .map(|(_, v)| *v)
}

fn nearest_nonzero_2d(table: &BTreeMap<(u64, u64), f64>, query: (u64, u64)) -> Option<f64> {
    table
        .iter()
        .filter(|(_, v)| **v > 0.0)
        .min_by_key(|((b, kv), _)| (sq_dist(*b, query.0) + sq_dist(*kv, query.1), (*b, *kv)))
        .map(|(_, v)| *v)
}

/// Last-resort fallback when an entire axis is zero; picks the smallest
/// non-zero value of the table so the estimate stays pessimistic, or a
/// conservative constant when the table is all zeros.
fn fallback_nonzero(values: impl Iterator<Item = f64>) -> f64 {
    let min = values.filter(|v| *v > 0.0).fold(f64::INFINITY, f64::min);
    if min.is_finite() {
        min
    } else {
        0.01
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use std::io::Write;

    const ATTN: AttnKey = (32, 8, 128);

    fn db() -> MfuDb {
        MfuDb::from_tables(
            btreemap! {
                (4096, 4096) => btreemap! { 16 => 0.10, 256 => 0.45, 4096 => 0.62 },
                (4096, 14336) => btreemap! { 256 => 0.55 },
            },
            btreemap! {
                ATTN => btreemap! { 512 => 0.30, 2048 => 0.42, 8192 => 0.50 },
            },
            btreemap! {
                1 => btreemap! {
                    ATTN => btreemap! {
                        (1, 512) => 0.0,
                        (8, 512) => 0.05,
                        (8, 4096) => 0.12,
                        (64, 4096) => 0.25,
                    },
                },
            },
        )
    }

    #[test]
    fn exact_match_wins() {
        assert_eq!(db().gemm(256, 4096, 4096), 0.45);
        assert_eq!(db().prefill(ATTN, 2048), 0.42);
        assert_eq!(db().decode(1, ATTN, 8, 4096), 0.12);
    }

    #[test]
    fn floor_preferring_on_ordered_axes() {
        // 1000 floors to 256, never rounds up to 4096.
        assert_eq!(db().gemm(1000, 4096, 4096), 0.45);
        // Below the smallest key: take the smallest.
        assert_eq!(db().prefill(ATTN, 100), 0.30);
        // 32 floors to batch 8; kv 600 floors to 512.
        assert_eq!(db().decode(1, ATTN, 32, 600), 0.05);
    }

    #[test]
    fn euclidean_nearest_on_attention_config() {
        // (30, 8, 128) is closest to the single benchmarked config.
        assert_eq!(db().prefill((30, 8, 128), 2048), 0.42);
        // GEMM shape snaps to the nearest benchmarked (k, n).
        assert_eq!(db().gemm(256, 4000, 14000), 0.55);
    }

    #[test]
    fn zero_cell_resolves_to_nearest_nonzero() {
        // (1, 512) is benchmarked as zero; nearest non-zero is (8, 512),
        // not whichever entry happened to be inserted first.
        assert_eq!(db().decode(1, ATTN, 1, 512), 0.05);
    }

    #[test]
    fn loads_csv_tree() {
        let root = tempfile::tempdir().unwrap();
        let write = |rel: &str, contents: &str| {
            let path = root.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            let mut file = std::fs::File::create(path).unwrap();
            file.write_all(contents.as_bytes()).unwrap();
        };
        write("gemm/h100/gemm.csv", "m,k,n,mfu\n256,4096,4096,0.45\n");
        write(
            "mha/prefill/h100/prefill.csv",
            "num_heads,num_kv_heads,head_dim,seq_len,mfu\n32,8,128,2048,0.42\n",
        );
        write(
            "mha/decode/h100/decode_tp1.csv",
            "num_heads,num_kv_heads,head_dim,batch_size,kv_len,mfu\n32,8,128,8,4096,0.12\n",
        );
        write(
            "mha/decode/h100/decode_tp2.csv",
            "num_heads,num_kv_heads,head_dim,batch_size,kv_len,mfu\n32,8,128,8,4096,0.15\n",
        );

        let db = MfuDb::load(root.path(), "h100").unwrap();
        assert!(db.has_tp(1));
        assert!(db.has_tp(2));
        assert!(!db.has_tp(4));
        assert_eq!(db.decode(2, ATTN, 8, 4096), 0.15);
    }

    #[test]
    fn missing_gpu_directory_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        assert!(matches!(
            MfuDb::load(root.path(), "h100"),
            Err(MfuError::MissingDir(_))
        ));
    }
}
