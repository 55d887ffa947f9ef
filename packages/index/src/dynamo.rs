//! `DynamoDB`-backed [`KeyedStore`].
//!
//! # Table layout
//!
//! | Attribute | Type | Role |
//! |---|---|---|
//! | `sha3` | S | Partition key: SHA3-512 digest, or the XXH64 digest in fast mode |
//! | `blake2` | S | Sort key: BLAKE2b-512 digest, or `-` in fast mode |
//! | `locations` | L of M | Every place the chunk was written, in discovery order |
//! | `revision` | N | Bumped on every write; conditional updates compare it |
//! | `mode` | S | `default` or `fast` |
//!
//! Items written before `revision` existed are read as revision `0`, and a
//! conditional write expecting `0` accepts them.
//!
//! Every append rewrites the whole `locations` list, so an item grows with
//! each upload of its chunk. `DynamoDB` rejects items over 400 KB; a chunk
//! seen a few thousand times ends up there and its `PutItem` fails
//! validation. Writes at three quarters of the limit are logged.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_dynamodb::operation::describe_table::DescribeTableError;
use aws_sdk_dynamodb::operation::put_item::PutItemError;
use aws_sdk_dynamodb::operation::update_table::UpdateTableError;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, KeySchemaElement, KeyType, ProvisionedThroughput,
    ScalarAttributeType, TableDescription, TableStatus,
};
use supersync_fingerprint::Fingerprint;
use supersync_index_models::{ByteRange, Capacity, IndexEntry, Location};

use crate::store::{KeyedStore, PutOutcome, StoreError};

/// Partition key attribute.
pub const HASH_KEY: &str = "sha3";

/// Sort key attribute.
pub const RANGE_KEY: &str = "blake2";

const LOCATIONS_ATTR: &str = "locations";
const REVISION_ATTR: &str = "revision";
const MODE_ATTR: &str = "mode";

/// Provisioned throughput for newly created tables.
const INITIAL_CAPACITY: Capacity = Capacity::new(5, 5);

/// Delay between table status polls while waiting for `ACTIVE`.
const ACTIVE_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Maximum number of status polls before giving up (5 minutes).
const ACTIVE_MAX_POLLS: u32 = 150;

/// Largest item `DynamoDB` accepts, in bytes.
const ITEM_SIZE_LIMIT: usize = 400 * 1024;

/// Estimated item size above which writes are logged as approaching
/// [`ITEM_SIZE_LIMIT`].
const ITEM_SIZE_WARNING: usize = ITEM_SIZE_LIMIT * 3 / 4;

/// Content index table in `DynamoDB`.
pub struct DynamoStore {
    client: aws_sdk_dynamodb::Client,
    table: String,
}

impl DynamoStore {
    /// Wraps an existing client for `table`.
    #[must_use]
    pub fn new(client: aws_sdk_dynamodb::Client, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
        }
    }

    /// Validates the table's key schema, creating the table if it does not
    /// exist.
    ///
    /// A new table is created with a `sha3` partition key, a `blake2` sort
    /// key and [`INITIAL_CAPACITY`], and this call waits until it is active.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Schema`] if the existing table is keyed
    /// differently, and [`StoreError::Request`] on `DynamoDB` failures.
    pub async fn ensure_table(&self) -> Result<(), StoreError> {
        match self.describe().await {
            Ok(table) => {
                validate_key_schema(&self.table, &table)?;
                log::debug!("Index table {} exists with a valid key schema", self.table);
                Ok(())
            }
            Err(DescribeOutcome::NotFound) => {
                log::info!("Index table {} does not exist, creating", self.table);
                self.create_table().await?;
                self.wait_until_active().await
            }
            Err(DescribeOutcome::Failed(e)) => Err(e),
        }
    }

    async fn create_table(&self) -> Result<(), StoreError> {
        let attribute = |name: &str| {
            AttributeDefinition::builder()
                .attribute_name(name)
                .attribute_type(ScalarAttributeType::S)
                .build()
                .map_err(|e| self.request_error("CreateTable", e))
        };
        let key = |name: &str, key_type: KeyType| {
            KeySchemaElement::builder()
                .attribute_name(name)
                .key_type(key_type)
                .build()
                .map_err(|e| self.request_error("CreateTable", e))
        };

        self.client
            .create_table()
            .table_name(&self.table)
            .attribute_definitions(attribute(HASH_KEY)?)
            .attribute_definitions(attribute(RANGE_KEY)?)
            .key_schema(key(HASH_KEY, KeyType::Hash)?)
            .key_schema(key(RANGE_KEY, KeyType::Range)?)
            .provisioned_throughput(self.throughput(INITIAL_CAPACITY)?)
            .send()
            .await
            .map_err(|e| self.request_error("CreateTable", e))?;

        Ok(())
    }

    async fn wait_until_active(&self) -> Result<(), StoreError> {
        for _ in 0..ACTIVE_MAX_POLLS {
            let table = self.describe().await.map_err(|e| match e {
                DescribeOutcome::NotFound => StoreError::Malformed {
                    table: self.table.clone(),
                    message: "table disappeared while waiting for it".to_string(),
                },
                DescribeOutcome::Failed(e) => e,
            })?;

            if table.table_status() == Some(&TableStatus::Active) {
                return Ok(());
            }

            log::debug!(
                "Waiting for table {} to become active (status {:?})",
                self.table,
                table.table_status()
            );
            tokio::time::sleep(ACTIVE_POLL_INTERVAL).await;
        }

        Err(StoreError::Request {
            operation: "DescribeTable",
            table: self.table.clone(),
            source: "table did not become active in time".into(),
        })
    }

    async fn describe(&self) -> Result<TableDescription, DescribeOutcome> {
        let output = self
            .client
            .describe_table()
            .table_name(&self.table)
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .is_some_and(DescribeTableError::is_resource_not_found_exception)
                {
                    DescribeOutcome::NotFound
                } else {
                    DescribeOutcome::Failed(self.request_error("DescribeTable", err))
                }
            })?;

        output
            .table()
            .cloned()
            .ok_or_else(|| DescribeOutcome::Failed(self.malformed("DescribeTable returned no table")))
    }

    fn throughput(&self, capacity: Capacity) -> Result<ProvisionedThroughput, StoreError> {
        ProvisionedThroughput::builder()
            .read_capacity_units(to_units(capacity.read_units))
            .write_capacity_units(to_units(capacity.write_units))
            .build()
            .map_err(|e| self.request_error("UpdateTable", e))
    }

    fn key_attributes(fingerprint: &Fingerprint) -> [(String, AttributeValue); 2] {
        let (first, second) = fingerprint.key_parts();
        [
            (HASH_KEY.to_string(), AttributeValue::S(first.to_string())),
            (RANGE_KEY.to_string(), AttributeValue::S(second.to_string())),
        ]
    }

    fn request_error(
        &self,
        operation: &'static str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> StoreError {
        StoreError::Request {
            operation,
            table: self.table.clone(),
            source: Box::new(source),
        }
    }

    fn malformed(&self, message: impl Into<String>) -> StoreError {
        StoreError::Malformed {
            table: self.table.clone(),
            message: message.into(),
        }
    }
}

enum DescribeOutcome {
    NotFound,
    Failed(StoreError),
}

#[async_trait]
impl KeyedStore for DynamoStore {
    fn name(&self) -> &str {
        &self.table
    }

    async fn get_item(&self, fingerprint: &Fingerprint) -> Result<Option<IndexEntry>, StoreError> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table)
            .set_key(Some(Self::key_attributes(fingerprint).into_iter().collect()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| self.request_error("GetItem", e))?;

        output
            .item()
            .map(|item| decode_entry(item).map_err(|message| self.malformed(message)))
            .transpose()
    }

    async fn put_item(
        &self,
        fingerprint: &Fingerprint,
        entry: &IndexEntry,
        expected_revision: Option<u64>,
    ) -> Result<PutOutcome, StoreError> {
        let item = encode_item(fingerprint, entry);
        let size = approximate_item_size(&item);
        if size >= ITEM_SIZE_WARNING {
            log::warn!(
                "Index entry {} in {} holds {} locations (~{} KiB of {} KiB allowed); writes \
                 will fail once it outgrows the item size limit",
                fingerprint.short(),
                self.table,
                entry.locations.len(),
                size / 1024,
                ITEM_SIZE_LIMIT / 1024
            );
        }

        let mut request = self
            .client
            .put_item()
            .table_name(&self.table)
            .set_item(Some(item))
            .expression_attribute_names("#pk", HASH_KEY);

        request = match expected_revision {
            None => request.condition_expression("attribute_not_exists(#pk)"),
            Some(0) => request
                .condition_expression(
                    "attribute_exists(#pk) AND (attribute_not_exists(#rev) OR #rev = :expected)",
                )
                .expression_attribute_names("#rev", REVISION_ATTR)
                .expression_attribute_values(":expected", AttributeValue::N("0".to_string())),
            Some(revision) => request
                .condition_expression("attribute_exists(#pk) AND #rev = :expected")
                .expression_attribute_names("#rev", REVISION_ATTR)
                .expression_attribute_values(":expected", AttributeValue::N(revision.to_string())),
        };

        match request.send().await {
            Ok(_) => Ok(PutOutcome::Written),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(PutItemError::is_conditional_check_failed_exception) =>
            {
                Ok(PutOutcome::Conflict)
            }
            Err(err) => Err(self.request_error("PutItem", err)),
        }
    }

    async fn describe_capacity(&self) -> Result<Capacity, StoreError> {
        let table = self.describe().await.map_err(|e| match e {
            DescribeOutcome::NotFound => self.malformed("table does not exist"),
            DescribeOutcome::Failed(e) => e,
        })?;

        // On-demand tables report no provisioned throughput.
        let Some(throughput) = table.provisioned_throughput() else {
            return Ok(Capacity::new(0, 0));
        };

        Ok(Capacity::new(
            from_units(throughput.read_capacity_units()),
            from_units(throughput.write_capacity_units()),
        ))
    }

    async fn update_capacity(&self, capacity: Capacity) -> Result<(), StoreError> {
        let result = self
            .client
            .update_table()
            .table_name(&self.table)
            .provisioned_throughput(self.throughput(capacity)?)
            .send()
            .await;

        match result {
            Ok(_) => self.wait_until_active().await,
            Err(err) => {
                let busy = err.as_service_error().is_some_and(|e| {
                    e.is_limit_exceeded_exception() || e.is_resource_in_use_exception()
                });
                if busy {
                    return Err(StoreError::CapacityBusy {
                        table: self.table.clone(),
                        message: err
                            .as_service_error()
                            .map_or_else(|| err.to_string(), UpdateTableError::to_string),
                    });
                }
                Err(self.request_error("UpdateTable", err))
            }
        }
    }
}

/// Checks that `table` is keyed on `sha3` (HASH) and `blake2` (RANGE).
fn validate_key_schema(name: &str, table: &TableDescription) -> Result<(), StoreError> {
    let schema = table.key_schema();
    let schema_error = |message: String| StoreError::Schema {
        table: name.to_string(),
        message,
    };

    if schema.len() != 2 {
        return Err(schema_error(format!(
            "expected a composite key, found {} key attribute(s)",
            schema.len()
        )));
    }

    for element in schema {
        let expected = match element.key_type() {
            KeyType::Hash => HASH_KEY,
            KeyType::Range => RANGE_KEY,
            other => {
                return Err(schema_error(format!("unknown key type {other:?}")));
            }
        };
        if element.attribute_name() != expected {
            return Err(schema_error(format!(
                "{:?} key must be named {expected}, found {}",
                element.key_type(),
                element.attribute_name()
            )));
        }
    }

    Ok(())
}

fn to_units(units: u64) -> i64 {
    i64::try_from(units).unwrap_or(i64::MAX)
}

fn from_units(units: Option<i64>) -> u64 {
    units.and_then(|u| u64::try_from(u).ok()).unwrap_or(0)
}

/// Builds the full item for `entry` under `fingerprint`.
fn encode_item(fingerprint: &Fingerprint, entry: &IndexEntry) -> HashMap<String, AttributeValue> {
    let mut item: HashMap<String, AttributeValue> =
        DynamoStore::key_attributes(fingerprint).into_iter().collect();
    item.insert(
        LOCATIONS_ATTR.to_string(),
        AttributeValue::L(entry.locations.iter().map(encode_location).collect()),
    );
    item.insert(
        REVISION_ATTR.to_string(),
        AttributeValue::N(entry.revision.to_string()),
    );
    item.insert(
        MODE_ATTR.to_string(),
        AttributeValue::S(fingerprint.mode().to_string()),
    );
    item
}

/// Estimated stored size: attribute names plus value bytes, with a few
/// bytes of overhead per nested element.
fn approximate_item_size(item: &HashMap<String, AttributeValue>) -> usize {
    item.iter()
        .map(|(name, value)| name.len() + approximate_value_size(value))
        .sum()
}

fn approximate_value_size(value: &AttributeValue) -> usize {
    match value {
        AttributeValue::S(s) | AttributeValue::N(s) => s.len(),
        AttributeValue::L(values) => {
            3 + values
                .iter()
                .map(|v| 1 + approximate_value_size(v))
                .sum::<usize>()
        }
        AttributeValue::M(map) => 3 + approximate_item_size(map) + map.len(),
        _ => 1,
    }
}

fn encode_location(location: &Location) -> AttributeValue {
    AttributeValue::M(HashMap::from([
        ("bucket".to_string(), AttributeValue::S(location.bucket.clone())),
        ("key".to_string(), AttributeValue::S(location.key.clone())),
        ("version".to_string(), AttributeValue::S(location.version.clone())),
        ("part".to_string(), AttributeValue::N(location.part.to_string())),
        ("upload_id".to_string(), AttributeValue::S(location.upload_id.clone())),
        (
            "content_range".to_string(),
            AttributeValue::S(location.content_range.to_string()),
        ),
    ]))
}

/// Decodes a stored item. Errors are plain messages; the caller adds the
/// table name.
fn decode_entry(item: &HashMap<String, AttributeValue>) -> Result<IndexEntry, String> {
    let locations = match item.get(LOCATIONS_ATTR) {
        None => Vec::new(),
        Some(value) => value
            .as_l()
            .map_err(|_| format!("{LOCATIONS_ATTR} is not a list"))?
            .iter()
            .map(decode_location)
            .collect::<Result<Vec<_>, _>>()?,
    };

    let revision = match item.get(REVISION_ATTR) {
        None => 0,
        Some(value) => value
            .as_n()
            .map_err(|_| format!("{REVISION_ATTR} is not a number"))?
            .parse()
            .map_err(|e| format!("{REVISION_ATTR}: {e}"))?,
    };

    Ok(IndexEntry {
        locations,
        revision,
    })
}

fn decode_location(value: &AttributeValue) -> Result<Location, String> {
    let map = value
        .as_m()
        .map_err(|_| "location is not a map".to_string())?;

    let string = |name: &str| {
        map.get(name)
            .and_then(|v| v.as_s().ok())
            .cloned()
            .ok_or_else(|| format!("location is missing string attribute {name}"))
    };

    let part = map
        .get("part")
        .and_then(|v| v.as_n().ok())
        .ok_or_else(|| "location is missing numeric attribute part".to_string())?
        .parse::<u32>()
        .map_err(|e| format!("location part: {e}"))?;

    let content_range: ByteRange = string("content_range")?
        .parse()
        .map_err(|e| format!("location content_range: {e}"))?;

    Ok(Location {
        bucket: string("bucket")?,
        key: string("key")?,
        version: string("version")?,
        part,
        upload_id: string("upload_id")?,
        content_range,
    })
}

#[cfg(test)]
mod tests {
    use supersync_fingerprint::{HashMode, fingerprint};

    use super::*;

    fn location(part: u32) -> Location {
        Location {
            bucket: "backups".to_string(),
            key: "vm/disk.img".to_string(),
            version: "3HL4kqtJlcpXroDTDmJ".to_string(),
            part,
            upload_id: "upload-1".to_string(),
            content_range: ByteRange::new(u64::from(part - 1) * 100, u64::from(part) * 100 - 1),
        }
    }

    #[test]
    fn encoded_item_carries_key_revision_and_locations() {
        let fp = fingerprint(b"chunk", HashMode::Default);
        let entry = IndexEntry {
            locations: vec![location(1), location(2)],
            revision: 7,
        };
        let item = encode_item(&fp, &entry);

        let (sha3, blake2) = fp.key_parts();
        assert_eq!(item[HASH_KEY].as_s().unwrap(), sha3);
        assert_eq!(item[RANGE_KEY].as_s().unwrap(), blake2);
        assert_eq!(item[REVISION_ATTR].as_n().unwrap(), "7");
        assert_eq!(item[MODE_ATTR].as_s().unwrap(), "default");
        assert_eq!(item[LOCATIONS_ATTR].as_l().unwrap().len(), 2);

        let rebuilt = Fingerprint::from_key_parts(
            item[HASH_KEY].as_s().unwrap(),
            item[RANGE_KEY].as_s().unwrap(),
        )
        .unwrap();
        assert_eq!(rebuilt, fp);
    }

    #[test]
    fn fast_fingerprint_uses_placeholder_sort_key() {
        let fp = fingerprint(b"chunk", HashMode::Fast);
        let item = encode_item(&fp, &IndexEntry::default());
        assert_eq!(item[RANGE_KEY].as_s().unwrap(), "-");
        assert_eq!(item[MODE_ATTR].as_s().unwrap(), "fast");
        assert_eq!(
            Fingerprint::from_key_parts(item[HASH_KEY].as_s().unwrap(), "-").unwrap(),
            fp
        );
    }

    #[test]
    fn decode_inverts_encode() {
        let fp = fingerprint(b"chunk", HashMode::Default);
        let entry = IndexEntry {
            locations: vec![location(3), location(1), location(3)],
            revision: 2,
        };
        let decoded = decode_entry(&encode_item(&fp, &entry)).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn items_without_revision_read_as_revision_zero() {
        let mut item = encode_item(
            &fingerprint(b"legacy", HashMode::Default),
            &IndexEntry {
                locations: vec![location(1)],
                revision: 0,
            },
        );
        item.remove(REVISION_ATTR);
        item.remove(MODE_ATTR);

        let decoded = decode_entry(&item).unwrap();
        assert_eq!(decoded.revision, 0);
        assert_eq!(decoded.locations, vec![location(1)]);
    }

    #[test]
    fn malformed_location_is_rejected() {
        let mut bad = HashMap::new();
        bad.insert("bucket".to_string(), AttributeValue::S("b".to_string()));
        bad.insert("part".to_string(), AttributeValue::S("not a number".to_string()));

        let mut item = HashMap::new();
        item.insert(
            LOCATIONS_ATTR.to_string(),
            AttributeValue::L(vec![AttributeValue::M(bad)]),
        );

        let err = decode_entry(&item).unwrap_err();
        assert!(err.contains("part"), "{err}");
    }

    #[test]
    fn key_schema_validation_accepts_sha3_blake2() {
        let table = TableDescription::builder()
            .key_schema(
                KeySchemaElement::builder()
                    .attribute_name(HASH_KEY)
                    .key_type(KeyType::Hash)
                    .build()
                    .unwrap(),
            )
            .key_schema(
                KeySchemaElement::builder()
                    .attribute_name(RANGE_KEY)
                    .key_type(KeyType::Range)
                    .build()
                    .unwrap(),
            )
            .build();
        assert!(validate_key_schema("t", &table).is_ok());
    }

    #[test]
    fn key_schema_validation_rejects_simple_key() {
        let table = TableDescription::builder()
            .key_schema(
                KeySchemaElement::builder()
                    .attribute_name("id")
                    .key_type(KeyType::Hash)
                    .build()
                    .unwrap(),
            )
            .build();
        let err = validate_key_schema("t", &table).unwrap_err();
        assert!(matches!(err, StoreError::Schema { .. }));
    }

    #[test]
    fn unit_conversions_saturate() {
        assert_eq!(to_units(u64::MAX), i64::MAX);
        assert_eq!(from_units(Some(-1)), 0);
        assert_eq!(from_units(None), 0);
        assert_eq!(from_units(Some(25)), 25);
    }

    #[test]
    fn item_size_tracks_location_count() {
        let fp = fingerprint(b"zeros", HashMode::Default);
        let entry_with = |count: u32| IndexEntry {
            locations: (1..=count).map(location).collect(),
            revision: u64::from(count),
        };

        let small = approximate_item_size(&encode_item(&fp, &entry_with(10)));
        let popular = approximate_item_size(&encode_item(&fp, &entry_with(4_000)));

        assert!(small < ITEM_SIZE_WARNING);
        assert!(popular >= ITEM_SIZE_WARNING);
        assert!(popular > small * 100);
    }
}
