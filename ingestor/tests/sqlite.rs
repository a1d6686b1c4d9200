mod common;

use std::sync::Arc;

use common::{labels, series};
use ingestor::{
    storage::{Catalog, SqliteBackend},
    Config, ErrorKind, Ingestor, WriteRequest,
};

fn request() -> WriteRequest {
    WriteRequest::new(vec![
        series(&[("__name__", "up"), ("job", "node")], [(1000, 1.0), (2000, 1.0)]),
        series(&[("__name__", "up"), ("job", "api")], [(1000, 0.0)]),
        series(&[("__name__", "node_load1")], [(1000, 0.75)]),
    ])
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ingest_into_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(SqliteBackend::open(dir.path().join("metrics.db")).unwrap());
    let ingestor = Ingestor::builder(backend.clone(), backend.clone())
        .config(Config {
            copier_workers: 2,
            ..Config::default()
        })
        .build()
        .unwrap();

    assert_eq!(ingestor.ingest(request()).await.into_result().unwrap(), 4);
    // same request again only upserts
    assert_eq!(ingestor.ingest(request()).await.into_result().unwrap(), 4);
    ingestor.shutdown().await;

    assert_eq!(backend.metrics().await.unwrap(), ["node_load1", "up"]);
    let rows = backend.rows("up").await.unwrap();
    assert_eq!(rows.len(), 3);
    let load = backend.rows("node_load1").await.unwrap();
    assert_eq!(load.len(), 1);
    assert_eq!(load[0].value, 0.75);

    let labels_of_load = backend.series_labels(load[0].series_id).await.unwrap();
    assert_eq!(labels_of_load, Some(labels(&[("__name__", "node_load1")])));
}

#[tokio::test]
async fn test_sqlite_rejects_bad_metric_names() {
    let backend = Arc::new(SqliteBackend::open_in_memory().unwrap());
    let ingestor = Ingestor::builder(backend.clone(), backend.clone())
        .build()
        .unwrap();

    let report = ingestor
        .ingest(WriteRequest::new(vec![
            series(&[("__name__", "up")], [(1, 1.0)]),
            series(&[("__name__", "bad name")], [(1, 1.0)]),
        ]))
        .await;
    assert_eq!(report.rows_inserted, 1);
    assert_eq!(report.failed_batches, 1);
    assert_eq!(
        report.first_error.map(|e| e.kind()),
        Some(ErrorKind::DataIntegrity)
    );
}
