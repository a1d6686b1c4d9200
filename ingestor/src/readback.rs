// Copyright 2022 Zinc Labs Inc. and Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! SQL read-back over the in-memory store, one DataFusion table per metric.

use std::sync::Arc;

use arrow::{
    array::{ArrayRef, Float64Array, Int64Array, StringArray},
    datatypes::{DataType, Field, Schema},
    record_batch::RecordBatch,
};
use datafusion::{datasource::MemTable, error::Result, prelude::SessionContext};

use crate::storage::{ContainerSnapshot, MemoryBackend};

pub const FIELD_SERIES_ID: &str = "series_id";
pub const FIELD_TIME: &str = "_timestamp";
pub const FIELD_VALUE: &str = "value";

/// Prefix for label columns whose names would clash with another column,
/// following Prometheus' `exported_` convention.
pub const EXPORTED_PREFIX: &str = "exported_";

/// Creates a session context with an in-memory table for every metric
/// container of `backend`.
pub fn session_context(backend: &MemoryBackend) -> Result<SessionContext> {
    let ctx = SessionContext::new();
    for container in backend.snapshot() {
        let (schema, label_names) = create_schema(&container);
        let schema = Arc::new(schema);
        let batch = create_record_batch(schema.clone(), &label_names, &container)?;
        let provider = MemTable::try_new(schema, vec![vec![batch]])?;
        ctx.register_table(container.metric.as_str(), Arc::new(provider))?;
    }
    Ok(ctx)
}

/// Label columns in first-seen order, then series id, time and value.
/// Returns the schema and the label name behind each label column.
fn create_schema(container: &ContainerSnapshot) -> (Schema, Vec<String>) {
    let mut label_names = Vec::new();
    let mut seen = rustc_hash::FxHashSet::default();
    for (labels, _) in &container.rows {
        for label in labels.iter() {
            if seen.insert(label.name.as_str()) {
                label_names.push(label.name.clone());
            }
        }
    }

    let mut taken = rustc_hash::FxHashSet::default();
    taken.extend([FIELD_SERIES_ID, FIELD_TIME, FIELD_VALUE].map(String::from));
    let mut fields = Vec::with_capacity(label_names.len() + 3);
    for name in &label_names {
        let mut column = name.clone();
        while taken.contains(&column) || (seen.contains(column.as_str()) && column != *name) {
            column.insert_str(0, EXPORTED_PREFIX);
        }
        taken.insert(column.clone());
        fields.push(Field::new(column, DataType::Utf8, true));
    }
    fields.push(Field::new(FIELD_SERIES_ID, DataType::Int64, false));
    fields.push(Field::new(FIELD_TIME, DataType::Int64, false));
    fields.push(Field::new(FIELD_VALUE, DataType::Float64, false));
    (Schema::new(fields), label_names)
}

fn create_record_batch(
    schema: Arc<Schema>,
    label_names: &[String],
    container: &ContainerSnapshot,
) -> Result<RecordBatch> {
    let mut columns: Vec<ArrayRef> = label_names
        .iter()
        .map(|name| {
            let values = container
                .rows
                .iter()
                .map(|(labels, _)| labels.get(name))
                .collect::<Vec<_>>();
            Arc::new(StringArray::from(values)) as ArrayRef
        })
        .collect();
    let rows = container.rows.iter().map(|(_, row)| row);
    columns.push(Arc::new(Int64Array::from_iter_values(
        rows.clone().map(|r| r.series_id.get()),
    )));
    columns.push(Arc::new(Int64Array::from_iter_values(
        rows.clone().map(|r| r.timestamp),
    )));
    columns.push(Arc::new(Float64Array::from_iter_values(rows.map(|r| r.value))));
    Ok(RecordBatch::try_new(schema, columns)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        labels::LabelSet,
        model::Row,
        router::{Batch, PartitionKey},
        storage::{Catalog, SampleStore},
    };
    use datafusion::arrow::util::pretty::pretty_format_batches;
    use expect_test::expect;

    #[tokio::test]
    async fn test_session_context() {
        let backend = MemoryBackend::new();
        backend.ensure_metric_container("up").await.unwrap();
        let mut rows = Vec::new();
        for (job, instance) in [("node", Some("a")), ("api", None)] {
            let mut pairs = vec![("__name__", "up"), ("job", job)];
            pairs.extend(instance.map(|i| ("instance", i)));
            let labels = LabelSet::try_new(pairs).unwrap();
            let series_id = backend.get_or_create_series("up", &labels).await.unwrap();
            rows.extend((1..=2).map(|t| Row {
                series_id,
                timestamp: t * 1000,
                value: 1.0,
            }));
        }
        backend
            .insert_batch(&Batch {
                key: PartitionKey {
                    metric: "up".into(),
                    window_start: None,
                },
                rows,
            })
            .await
            .unwrap();

        let ctx = session_context(&backend).unwrap();
        let sql = "SELECT job, instance, series_id, _timestamp FROM up \
                   ORDER BY series_id, _timestamp";
        let df = ctx.sql(sql).await.unwrap();
        let batches = df.collect().await.unwrap();
        expect![[r#"
            +------+----------+-----------+------------+
            | job  | instance | series_id | _timestamp |
            +------+----------+-----------+------------+
            | node | a        | 1         | 1000       |
            | node | a        | 1         | 2000       |
            | api  |          | 2         | 1000       |
            | api  |          | 2         | 2000       |
            +------+----------+-----------+------------+"#]]
        .assert_eq(&pretty_format_batches(&batches).unwrap().to_string());

        let df = ctx.sql("SELECT sum(value) AS total FROM up").await.unwrap();
        let batches = df.collect().await.unwrap();
        let total = batches[0]
            .column(0)
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap()
            .value(0);
        assert_eq!(total, 4.0);
    }

    #[tokio::test]
    async fn test_label_named_like_a_field() {
        let backend = MemoryBackend::new();
        backend.ensure_metric_container("up").await.unwrap();
        let labels = LabelSet::try_new([
            ("__name__", "up"),
            ("value", "x"),
            ("exported_value", "y"),
        ])
        .unwrap();
        let series_id = backend.get_or_create_series("up", &labels).await.unwrap();
        backend
            .insert_batch(&Batch {
                key: PartitionKey {
                    metric: "up".into(),
                    window_start: None,
                },
                rows: vec![Row {
                    series_id,
                    timestamp: 1000,
                    value: 2.5,
                }],
            })
            .await
            .unwrap();

        let ctx = session_context(&backend).unwrap();
        // the `exported_value` label keeps its own name
        let sql = "SELECT value, exported_value, exported_exported_value FROM up";
        let batches = ctx.sql(sql).await.unwrap().collect().await.unwrap();
        expect![[r#"
            +-------+----------------+-------------------------+
            | value | exported_value | exported_exported_value |
            +-------+----------------+-------------------------+
            | 2.5   | y              | x                       |
            +-------+----------------+-------------------------+"#]]
        .assert_eq(&pretty_format_batches(&batches).unwrap().to_string());
    }
}
