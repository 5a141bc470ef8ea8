//! MongoDB-backed document store
//!
//! Each document is stored with `_id` set to the document id and a
//! `_version` stamp rewritten on every write. Commits and batches run inside
//! a multi-document transaction (replica set required). Read-set stamps are
//! re-checked inside the commit transaction; MongoDB's own write-conflict
//! detection covers documents that are both read and written. Documents
//! written by other tools carry no `_version` and read as version 0 on
//! both the read and the commit path.
//!
//! Field updates match [`super::MemoryStore`]: a null intermediate object on
//! a dotted path is replaced by an empty object before the `$set`.
//!
//! Collection names are the document path's collection verbatim.

use async_trait::async_trait;
use bson::{doc, Bson, Document as BsonDocument};
use futures::TryStreamExt;
use mongodb::{
    error::{Error as MongoError, TRANSIENT_TRANSACTION_ERROR},
    Client, ClientSession, Collection,
};
use serde_json::Value;
use tracing::{debug, info};

use super::{
    CommitOutcome, DocPath, DocumentStore, FieldPath, ReadStamp, StoredDocument, WriteOp,
};
use crate::error::{OrgSyncError, Result};

const VERSION_FIELD: &str = "_version";

fn store_err(e: MongoError) -> OrgSyncError {
    OrgSyncError::Store(e.to_string())
}

fn encode_err(e: bson::ser::Error) -> OrgSyncError {
    OrgSyncError::Validation(format!("cannot encode document: {}", e))
}

/// Fresh random write stamp; only equality is ever compared
fn new_stamp() -> i64 {
    uuid::Uuid::new_v4().as_u64_pair().0 as i64
}

/// Stamp of a stored document; documents never written by orgsync read as 0
fn stored_version(raw: &BsonDocument) -> u64 {
    raw.get_i64(VERSION_FIELD).map(|v| v as u64).unwrap_or_default()
}

/// Whether the document currently stored still carries the stamp read earlier
fn stamp_matches(stamp: &ReadStamp, current: Option<&BsonDocument>) -> bool {
    current.map(stored_version) == stamp.version
}

/// Proper prefixes of the dotted fields in an update, shortest first
///
/// `$set` cannot create `claims.flag` while `claims` is null, so these
/// prefixes are reset to empty objects first when they hold null.
fn parent_prefixes(fields: &[(FieldPath, Value)]) -> Vec<String> {
    let mut prefixes: Vec<String> = Vec::new();
    for (field, _) in fields {
        let segments = field.segments();
        for end in 1..segments.len() {
            let prefix = segments[..end].join(".");
            if !prefixes.contains(&prefix) {
                prefixes.push(prefix);
            }
        }
    }
    prefixes.sort_by_key(|p| p.matches('.').count());
    prefixes
}

/// Failure while applying writes inside a session
enum ApplyError {
    /// Transient transaction error: another writer touched the same document
    Contended(DocPath),
    Fatal(OrgSyncError),
}

impl From<OrgSyncError> for ApplyError {
    fn from(e: OrgSyncError) -> Self {
        ApplyError::Fatal(e)
    }
}

fn classify(path: DocPath, e: MongoError) -> ApplyError {
    if e.contains_label(TRANSIENT_TRANSACTION_ERROR) {
        ApplyError::Contended(path)
    } else {
        ApplyError::Fatal(store_err(e))
    }
}

/// MongoDB client wrapper implementing [`DocumentStore`]
#[derive(Clone)]
pub struct MongoStore {
    client: Client,
    db_name: String,
    max_batch_ops: usize,
}

impl MongoStore {
    /// Connect and verify with a ping
    pub async fn connect(uri: &str, db_name: &str, max_batch_ops: usize) -> Result<Self> {
        info!("Connecting to MongoDB at {}", uri);

        let client = Client::with_uri_str(uri).await.map_err(store_err)?;
        client
            .database(db_name)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(store_err)?;

        info!("Connected to MongoDB database '{}'", db_name);
        Ok(Self {
            client,
            db_name: db_name.to_string(),
            max_batch_ops,
        })
    }

    fn collection(&self, name: &str) -> Collection<BsonDocument> {
        self.client.database(&self.db_name).collection(name)
    }

    fn decode(path: DocPath, mut raw: BsonDocument) -> Result<StoredDocument> {
        let version = stored_version(&raw);
        raw.remove("_id");
        raw.remove(VERSION_FIELD);

        match Bson::Document(raw).into_relaxed_extjson() {
            Value::Object(data) => Ok(StoredDocument {
                path,
                data,
                version,
            }),
            _ => Err(OrgSyncError::Validation(format!("{} is not an object", path))),
        }
    }

    async fn decode_cursor(
        &self,
        collection: &str,
        mut cursor: mongodb::Cursor<BsonDocument>,
    ) -> Result<Vec<StoredDocument>> {
        let mut out = Vec::new();
        while let Some(raw) = cursor.try_next().await.map_err(store_err)? {
            let id = raw.get_str("_id").map(str::to_string).map_err(|_| {
                OrgSyncError::Validation(format!("document in '{}' has non-string _id", collection))
            })?;
            out.push(Self::decode(DocPath::new(collection, id), raw)?);
        }
        Ok(out)
    }

    async fn apply_writes(
        &self,
        session: &mut ClientSession,
        writes: Vec<WriteOp>,
    ) -> std::result::Result<(), ApplyError> {
        for op in writes {
            let path = op.path().clone();
            let coll = self.collection(path.collection());
            let filter = doc! { "_id": path.id() };

            let outcome = match op {
                WriteOp::Set { data, .. } => {
                    let mut replacement = bson::to_document(&data).map_err(encode_err)?;
                    replacement.insert("_id", path.id());
                    replacement.insert(VERSION_FIELD, new_stamp());
                    coll.replace_one(filter, replacement)
                        .upsert(true)
                        .session(&mut *session)
                        .await
                        .map(|_| ())
                }
                WriteOp::Update { fields, .. } => {
                    if let Err(e) = self
                        .reset_null_parents(&coll, path.id(), &fields, session)
                        .await
                    {
                        return Err(classify(path, e));
                    }

                    let mut set = BsonDocument::new();
                    for (field, value) in fields {
                        set.insert(field.to_string(), bson::to_bson(&value).map_err(encode_err)?);
                    }
                    set.insert(VERSION_FIELD, new_stamp());
                    match coll
                        .update_one(filter, doc! { "$set": set })
                        .session(&mut *session)
                        .await
                    {
                        Ok(result) if result.matched_count == 0 => {
                            return Err(OrgSyncError::NotFound(path.to_string()).into());
                        }
                        other => other.map(|_| ()),
                    }
                }
                WriteOp::Delete { .. } => coll
                    .delete_one(filter)
                    .session(&mut *session)
                    .await
                    .map(|_| ()),
            };

            if let Err(e) = outcome {
                return Err(classify(path, e));
            }
        }
        Ok(())
    }

    /// Replace null intermediate objects so dotted `$set` paths can be created
    async fn reset_null_parents(
        &self,
        coll: &Collection<BsonDocument>,
        id: &str,
        fields: &[(FieldPath, Value)],
        session: &mut ClientSession,
    ) -> std::result::Result<(), MongoError> {
        for prefix in parent_prefixes(fields) {
            let mut filter = doc! { "_id": id };
            filter.insert(prefix.as_str(), doc! { "$type": "null" });
            let mut reset = BsonDocument::new();
            reset.insert(prefix.as_str(), BsonDocument::new());

            coll.update_one(filter, doc! { "$set": reset })
                .session(&mut *session)
                .await?;
        }
        Ok(())
    }

    /// Validate `reads` and apply `writes` in one MongoDB transaction
    async fn transact(&self, reads: &[ReadStamp], writes: Vec<WriteOp>) -> Result<CommitOutcome> {
        let mut session = self.client.start_session().await.map_err(store_err)?;
        session.start_transaction().await.map_err(store_err)?;

        for stamp in reads {
            let current = self
                .collection(stamp.path.collection())
                .find_one(doc! { "_id": stamp.path.id() })
                .session(&mut session)
                .await
                .map_err(store_err)?;
            if !stamp_matches(stamp, current.as_ref()) {
                session.abort_transaction().await.map_err(store_err)?;
                return Ok(CommitOutcome::Stale {
                    path: stamp.path.clone(),
                });
            }
        }

        let first_path = writes.first().map(|op| op.path().clone());
        match self.apply_writes(&mut session, writes).await {
            Ok(()) => {}
            Err(ApplyError::Contended(path)) => {
                session.abort_transaction().await.map_err(store_err)?;
                return Ok(CommitOutcome::Stale { path });
            }
            Err(ApplyError::Fatal(e)) => {
                session.abort_transaction().await.map_err(store_err)?;
                return Err(e);
            }
        }

        match session.commit_transaction().await {
            Ok(()) => Ok(CommitOutcome::Committed),
            Err(e) if e.contains_label(TRANSIENT_TRANSACTION_ERROR) => {
                debug!(error = %e, "Commit hit transient transaction error");
                match first_path {
                    Some(path) => Ok(CommitOutcome::Stale { path }),
                    None => Err(store_err(e)),
                }
            }
            Err(e) => Err(store_err(e)),
        }
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn get(&self, path: &DocPath) -> Result<Option<StoredDocument>> {
        let raw = self
            .collection(path.collection())
            .find_one(doc! { "_id": path.id() })
            .await
            .map_err(store_err)?;
        raw.map(|raw| Self::decode(path.clone(), raw)).transpose()
    }

    async fn query(
        &self,
        collection: &str,
        field: &FieldPath,
        value: &Value,
    ) -> Result<Vec<StoredDocument>> {
        let mut filter = BsonDocument::new();
        filter.insert(field.to_string(), bson::to_bson(value).map_err(encode_err)?);

        let cursor = self
            .collection(collection)
            .find(filter)
            .sort(doc! { "_id": 1 })
            .await
            .map_err(store_err)?;
        self.decode_cursor(collection, cursor).await
    }

    async fn list(
        &self,
        collection: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoredDocument>> {
        let filter = match start_after {
            Some(after) => doc! { "_id": { "$gt": after } },
            None => doc! {},
        };

        let cursor = self
            .collection(collection)
            .find(filter)
            .sort(doc! { "_id": 1 })
            .limit(limit as i64)
            .await
            .map_err(store_err)?;
        self.decode_cursor(collection, cursor).await
    }

    async fn commit(&self, reads: &[ReadStamp], writes: Vec<WriteOp>) -> Result<CommitOutcome> {
        self.transact(reads, writes).await
    }

    async fn batch_write(&self, ops: Vec<WriteOp>) -> Result<()> {
        if ops.len() > self.max_batch_ops {
            return Err(OrgSyncError::BatchLimitExceeded {
                size: ops.len(),
                limit: self.max_batch_ops,
            });
        }

        match self.transact(&[], ops).await? {
            CommitOutcome::Committed => Ok(()),
            CommitOutcome::Stale { path } => Err(OrgSyncError::Store(format!(
                "batch interrupted by concurrent write to {}",
                path
            ))),
        }
    }

    fn max_batch_ops(&self) -> usize {
        self.max_batch_ops
    }
}
