use std::{fs, path::Path, sync::Arc};

use color_eyre::eyre::{eyre, Result, WrapErr};
use ingestor::{
    storage::{Catalog, MemoryBackend, SampleStore, SqliteBackend},
    Config, LabelSet, Sample, TimeSeries, WriteRequest,
};
use serde::{Deserialize, Serialize};

pub mod api;
pub mod http;

/// Prometheus HTTP API response
///
/// See https://prometheus.io/docs/prometheus/latest/querying/api/
#[derive(Debug, Serialize, Deserialize)]
struct Response {
    pub status: String,
    pub data: ResponseData,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseData {
    result_type: String,
    result: Vec<ResponseSeries>,
}

/// See https://docs.victoriametrics.com/keyConcepts.html#time-series
#[derive(Debug, Serialize, Deserialize)]
struct ResponseSeries {
    metric: serde_json::Map<String, serde_json::Value>,
    values: Vec<DataPoint>,
}

/// See https://docs.victoriametrics.com/keyConcepts.html#raw-samples
#[derive(Debug, Serialize, Deserialize)]
struct DataPoint {
    /// Unix time in seconds
    timestamp: f64,
    value: String,
}

/// Where ingested samples end up.
#[derive(Debug, Clone)]
pub enum Backend {
    Memory(Arc<MemoryBackend>),
    Sqlite(Arc<SqliteBackend>),
}

impl Backend {
    pub fn open(sqlite: Option<&Path>) -> Result<Self> {
        match sqlite {
            Some(path) => {
                let backend = SqliteBackend::open(path)
                    .wrap_err_with(|| format!("failed to open {}", path.display()))?;
                Ok(Backend::Sqlite(Arc::new(backend)))
            }
            None => Ok(Backend::Memory(Arc::new(MemoryBackend::new()))),
        }
    }

    pub fn catalog(&self) -> Arc<dyn Catalog> {
        match self {
            Backend::Memory(b) => b.clone(),
            Backend::Sqlite(b) => b.clone(),
        }
    }

    pub fn store(&self) -> Arc<dyn SampleStore> {
        match self {
            Backend::Memory(b) => b.clone(),
            Backend::Sqlite(b) => b.clone(),
        }
    }
}

/// Reads the JSON config file, if any; defaults otherwise.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let data = fs::read(path).wrap_err_with(|| format!("{}", path.display()))?;
    let config: Config = serde_json::from_slice(&data)
        .map_err(|e| eyre!("Failed to parse config file {}: {e}", path.display()))?;
    Ok(config)
}

/// Turns every `*.json` query response in `samples_dir` into a write
/// request, in file name order.
pub fn load_samples(samples_dir: impl AsRef<Path>) -> Result<Vec<WriteRequest>> {
    let samples_dir = samples_dir.as_ref();
    let mut paths = fs::read_dir(samples_dir)
        .wrap_err_with(|| format!("{}", samples_dir.display()))?
        .map(|dentry| dentry.map(|d| d.path()))
        .collect::<Result<Vec<_>, _>>()?;
    paths.sort();

    let mut requests = Vec::new();
    for path in paths {
        if path.extension().map_or(true, |ext| ext != "json") {
            continue;
        }
        requests.push(read_samples_file(&path)?);
    }
    Ok(requests)
}

fn read_samples_file(path: &Path) -> Result<WriteRequest> {
    let data = fs::read(path).wrap_err_with(|| format!("{}", path.display()))?;
    let resp: Response = serde_json::from_slice(&data)
        .map_err(|e| eyre!("Failed to parse JSON file {}: {e}", path.display()))?;

    let mut series = Vec::with_capacity(resp.data.result.len());
    for ts in resp.data.result {
        let labels = LabelSet::try_new(ts.metric.into_iter().map(|(name, value)| {
            let value = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (name, value)
        }))
        .wrap_err_with(|| format!("invalid labels in {}", path.display()))?;
        let samples = ts
            .values
            .iter()
            .map(|point| {
                let value = point.value.parse::<f64>().wrap_err_with(|| {
                    format!("invalid sample value {:?} in {}", point.value, path.display())
                })?;
                Ok(Sample::new((point.timestamp * 1000.0).round() as i64, value))
            })
            .collect::<Result<Vec<_>>>()?;
        series.push(TimeSeries::new(labels, samples));
    }
    Ok(WriteRequest::new(series))
}
