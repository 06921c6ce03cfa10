//! High-level repository operations
//!
//! A [`Repository`] owns a block store handle and the current head commit.
//! Writes go through [`Repository::apply_writes`]: records are encoded, the
//! MST is updated, a new commit is signed, and only then is the head swapped.
//! Everything before the swap is staged in memory, so a failed batch leaves
//! both the head and the base store untouched.

use std::fmt::{self, Display, Formatter};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use arbor_common::{Did, Ticker, Tid};
use bytes::Bytes;
use cid::Cid as IpldCid;
use smol_str::{SmolStr, format_smolstr};
use tokio::sync::Mutex;

use crate::codec::{self, Value};
use crate::commit::{Commit, RepoOp, Signer, build_commit};
use crate::config::RepoConfig;
use crate::error::{RepoError, Result};
use crate::mst::{Mst, WriteOp, diff, validate_key};
use crate::storage::{BlockStore, LayeredBlockStore, MemoryBlockStore, get_required};

/// A record write submitted to [`Repository::apply_writes`]
///
/// `swap`, when set on an update or delete, is the CID the caller expects the
/// record to have right now; any other value fails the whole batch.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordWrite {
    /// Create a record (error if it exists)
    Create {
        /// Collection name
        collection: SmolStr,
        /// Record key within the collection
        rkey: SmolStr,
        /// Record value
        value: Value,
    },

    /// Replace an existing record
    Update {
        /// Collection name
        collection: SmolStr,
        /// Record key within the collection
        rkey: SmolStr,
        /// New record value
        value: Value,
        /// Expected current CID
        swap: Option<IpldCid>,
    },

    /// Delete an existing record
    Delete {
        /// Collection name
        collection: SmolStr,
        /// Record key within the collection
        rkey: SmolStr,
        /// Expected current CID
        swap: Option<IpldCid>,
    },
}

impl RecordWrite {
    /// Create a record
    pub fn create(collection: impl Into<SmolStr>, rkey: impl Into<SmolStr>, value: Value) -> Self {
        RecordWrite::Create {
            collection: collection.into(),
            rkey: rkey.into(),
            value,
        }
    }

    /// Update a record without a swap check
    pub fn update(collection: impl Into<SmolStr>, rkey: impl Into<SmolStr>, value: Value) -> Self {
        RecordWrite::Update {
            collection: collection.into(),
            rkey: rkey.into(),
            value,
            swap: None,
        }
    }

    /// Delete a record without a swap check
    pub fn delete(collection: impl Into<SmolStr>, rkey: impl Into<SmolStr>) -> Self {
        RecordWrite::Delete {
            collection: collection.into(),
            rkey: rkey.into(),
            swap: None,
        }
    }

    /// Set the expected current CID (no effect on creates)
    pub fn with_swap(mut self, cid: IpldCid) -> Self {
        match &mut self {
            RecordWrite::Update { swap, .. } | RecordWrite::Delete { swap, .. } => {
                *swap = Some(cid)
            }
            RecordWrite::Create { .. } => {}
        }
        self
    }

    /// MST key (`<collection>/<rkey>`)
    pub fn key(&self) -> SmolStr {
        let (collection, rkey) = match self {
            RecordWrite::Create {
                collection, rkey, ..
            }
            | RecordWrite::Update {
                collection, rkey, ..
            }
            | RecordWrite::Delete {
                collection, rkey, ..
            } => (collection, rkey),
        };
        format_smolstr!("{}/{}", collection, rkey)
    }
}

/// Everything produced by one successful write
///
/// This is the delta handed to an event sequencer: the commit, the record
/// operations it contains, and exactly the blocks a holder of the previous
/// commit needs (the commit block first).
#[derive(Debug, Clone)]
pub struct CommitData {
    /// Commit CID
    pub cid: IpldCid,

    /// The signed commit
    pub commit: Commit,

    /// New revision TID
    pub rev: Tid,

    /// Previous revision TID (None for initial commit)
    pub since: Option<Tid>,

    /// Previous MST root CID
    pub prev_data: Option<IpldCid>,

    /// Record operations, sorted by path
    pub ops: Vec<RepoOp>,

    /// New blocks: the commit, then new MST nodes and records in reference order
    pub blocks: Vec<(IpldCid, Bytes)>,
}

impl CommitData {
    /// Package the blocks as a CAR rooted at the commit
    pub async fn to_car(&self) -> Result<Vec<u8>> {
        crate::car::write_car_bytes(self.cid, self.blocks.iter().cloned()).await
    }
}

#[derive(Debug)]
pub(crate) struct Head {
    pub(crate) cid: IpldCid,
    pub(crate) commit: Commit,
}

/// A single actor's repository
///
/// Reads take a snapshot of the head and never block on writers. Writes are
/// serialized by an async mutex: [`apply_writes`](Self::apply_writes) waits
/// its turn, [`try_apply_writes`](Self::try_apply_writes) fails with
/// [`Busy`](crate::RepoErrorKind::Busy) instead.
///
/// # Example
///
/// ```rust,ignore
/// use arbor_repo::{Repository, RecordWrite, MemoryBlockStore};
/// use arbor_repo::commit::KeyedSigner;
///
/// let storage = Arc::new(MemoryBlockStore::new());
/// let signer = KeyedSigner::new(did, key);
/// let repo = Repository::create(storage, &signer, RepoConfig::default()).await?;
///
/// let data = repo
///     .apply_writes(&[RecordWrite::create("app.example.post", "3jzfcijpj2z2a", value)], &signer)
///     .await?;
/// let car = data.to_car().await?;
/// ```
#[derive(Debug)]
pub struct Repository<S: BlockStore> {
    storage: Arc<S>,
    config: RepoConfig,
    head: RwLock<Arc<Head>>,
    writer: Mutex<Ticker>,
}

impl<S: BlockStore + Sync + 'static> Repository<S> {
    pub(crate) fn from_head(storage: Arc<S>, config: RepoConfig, head: Head) -> Self {
        Self {
            storage,
            config,
            head: RwLock::new(Arc::new(head)),
            writer: Mutex::new(Ticker::new()),
        }
    }

    /// Create a new repository with a signed genesis commit over the empty tree
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(did = %signer.did())))]
    pub async fn create(storage: Arc<S>, signer: &dyn Signer, config: RepoConfig) -> Result<Self> {
        let mst = Mst::new(storage.clone()).await?;
        let mut ticker = Ticker::new();
        let commit = build_commit(signer.did(), mst.root(), None, signer, &mut ticker)?;
        let (cid, bytes) = commit.to_block()?;
        storage.put_many([(cid, bytes)]).await?;

        let repo = Self::from_head(storage, config, Head { cid, commit });
        *repo.writer.lock().await = ticker;
        Ok(repo)
    }

    /// Load a repository whose head commit is `commit_cid`
    ///
    /// The commit must already be in storage.
    pub async fn load(storage: Arc<S>, commit_cid: IpldCid, config: RepoConfig) -> Result<Self> {
        let bytes = get_required(&*storage, &commit_cid, "commit").await?;
        let commit = Commit::from_cbor(&bytes)?;
        // the tree root has to resolve before anyone reads through it
        get_required(&*storage, commit.data(), "MST node").await?;

        Ok(Self::from_head(
            storage,
            config,
            Head {
                cid: commit_cid,
                commit,
            },
        ))
    }

    pub(crate) fn head(&self) -> Arc<Head> {
        self.head
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_head(&self, head: Head) {
        *self.head.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(head);
    }

    pub(crate) fn writer_lock(&self) -> &Mutex<Ticker> {
        &self.writer
    }

    /// Get reference to the storage
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Repository configuration
    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    /// Get the current commit
    pub fn current_commit(&self) -> Commit {
        self.head().commit.clone()
    }

    /// Get the current commit CID
    pub fn current_commit_cid(&self) -> IpldCid {
        self.head().cid
    }

    /// Get the DID from the current commit
    pub fn did(&self) -> Did {
        self.head().commit.did.clone()
    }

    /// Revision of the current commit
    pub fn rev(&self) -> Tid {
        self.head().commit.rev.clone()
    }

    /// The MST at the current commit
    pub fn mst(&self) -> Mst<S> {
        Mst::load(self.storage.clone(), self.head().commit.data)
    }

    /// CID of a record, `None` if the key is absent
    pub async fn get_record_cid(&self, collection: &str, rkey: &str) -> Result<Option<IpldCid>> {
        self.mst()
            .get(&format_smolstr!("{}/{}", collection, rkey))
            .await
    }

    /// Decoded record value, `None` if the key is absent
    ///
    /// A key whose record block is missing from storage is a `NotFound` error.
    pub async fn get_record(&self, collection: &str, rkey: &str) -> Result<Option<Value>> {
        match self.get_record_cid(collection, rkey).await? {
            Some(cid) => {
                let bytes = get_required(&*self.storage, &cid, "record").await?;
                Ok(Some(codec::decode(&bytes)?))
            }
            None => Ok(None),
        }
    }

    /// Every record in a collection as (rkey, CID), in key order
    pub async fn list_records(&self, collection: &str) -> Result<Vec<(SmolStr, IpldCid)>> {
        let prefix = format_smolstr!("{}/", collection);
        let leaves = self.mst().list_with_prefix(&prefix, usize::MAX).await?;
        Ok(leaves
            .into_iter()
            .map(|(key, cid)| (SmolStr::new(&key[prefix.len()..]), cid))
            .collect())
    }

    /// Apply a batch of writes as one signed commit, waiting for any in-flight write
    pub async fn apply_writes(
        &self,
        writes: &[RecordWrite],
        signer: &dyn Signer,
    ) -> Result<CommitData> {
        let mut ticker = self.writer.lock().await;
        self.write_locked(writes, signer, &mut ticker).await
    }

    /// Like [`apply_writes`](Self::apply_writes) but fails with `Busy` if a write is in flight
    pub async fn try_apply_writes(
        &self,
        writes: &[RecordWrite],
        signer: &dyn Signer,
    ) -> Result<CommitData> {
        let mut ticker = self.writer.try_lock().map_err(|_| RepoError::busy())?;
        self.write_locked(writes, signer, &mut ticker).await
    }

    fn check_batch(&self, writes: &[RecordWrite]) -> Result<()> {
        if writes.len() > self.config.max_ops_per_commit {
            return Err(RepoError::invalid_write(format!(
                "{} writes in one batch, max {}",
                writes.len(),
                self.config.max_ops_per_commit
            )));
        }

        let mut seen = std::collections::HashSet::with_capacity(writes.len());
        for write in writes {
            let key = write.key();
            validate_key(&key)?;
            if !seen.insert(key.clone()) {
                return Err(RepoError::invalid_write(format!(
                    "key {} appears more than once in the batch",
                    key
                )));
            }
        }
        Ok(())
    }

    fn encode_value(&self, key: &str, value: &Value) -> Result<(IpldCid, Bytes)> {
        let (cid, bytes) = codec::encode_record(value)
            .map_err(|e| e.with_context(format!("encoding record {}", key)))?;
        if bytes.len() > self.config.max_record_size {
            return Err(RepoError::invalid_write(format!(
                "record {} is {} bytes, max {}",
                key,
                bytes.len(),
                self.config.max_record_size
            )));
        }
        Ok((cid, bytes))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(writes = writes.len())))]
    async fn write_locked(
        &self,
        writes: &[RecordWrite],
        signer: &dyn Signer,
        ticker: &mut Ticker,
    ) -> Result<CommitData> {
        let head = self.head();
        self.check_batch(writes)?;

        // Stage everything on top of the base store
        let staging = Arc::new(LayeredBlockStore::new(
            MemoryBlockStore::new(),
            self.storage.clone(),
        ));

        let mut ops = Vec::with_capacity(writes.len());
        let mut records = Vec::new();
        for write in writes {
            let key = write.key();
            let op = match write {
                RecordWrite::Create { value, .. } => {
                    let (cid, bytes) = self.encode_value(&key, value)?;
                    records.push((cid, bytes));
                    WriteOp::Create { key, cid }
                }
                RecordWrite::Update { value, swap, .. } => {
                    let (cid, bytes) = self.encode_value(&key, value)?;
                    records.push((cid, bytes));
                    WriteOp::Update {
                        key,
                        cid,
                        prev: *swap,
                    }
                }
                RecordWrite::Delete { swap, .. } => WriteOp::Delete { key, prev: *swap },
            };
            ops.push(op);
        }
        staging.put_many(records).await?;

        let old_data = head.commit.data;
        let mst = Mst::load(staging.clone(), old_data).batch(&ops).await?;
        let new_data = mst.root();

        let commit = build_commit(
            head.commit.did(),
            new_data,
            Some((head.cid, &head.commit)),
            signer,
            ticker,
        )?;
        let (commit_cid, commit_bytes) = commit.to_block()?;

        let delta = diff(&staging, Some(old_data), new_data).await?;
        let mut blocks = Vec::with_capacity(delta.new_blocks.len() + 1);
        blocks.push((commit_cid, commit_bytes));
        blocks.extend(delta.fetch_new_blocks(&*staging).await?);

        self.storage.put_many(blocks.clone()).await?;
        self.set_head(Head {
            cid: commit_cid,
            commit: commit.clone(),
        });

        #[cfg(feature = "tracing")]
        tracing::debug!(
            commit = %commit_cid,
            rev = %commit.rev,
            ops = delta.op_count(),
            blocks = blocks.len(),
            "published commit"
        );

        Ok(CommitData {
            cid: commit_cid,
            rev: commit.rev.clone(),
            since: Some(head.commit.rev.clone()),
            prev_data: Some(old_data),
            ops: delta.to_repo_ops(),
            commit,
            blocks,
        })
    }

    /// Export the whole repository at the current commit as a CAR
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all))]
    pub async fn export(&self) -> Result<Vec<u8>> {
        let head = self.head();
        crate::car::export_repo_car_bytes(head.cid, &self.mst_at(&head)).await
    }

    /// Export the whole repository at the current commit to a CAR file
    pub async fn export_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let head = self.head();
        crate::car::export_repo_car(path, head.cid, &self.mst_at(&head)).await
    }

    /// Export the blocks needed to advance from `since` to the current commit
    ///
    /// `None` exports everything. Otherwise `since` must name an earlier
    /// commit of this repository held in storage; the CAR holds the current
    /// commit followed by only the blocks the old commit's tree does not have.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip(self)))]
    pub async fn export_since(&self, since: Option<IpldCid>) -> Result<Vec<u8>> {
        let since = match since {
            Some(since) => since,
            None => return self.export().await,
        };

        let head = self.head();
        let old_bytes = get_required(&*self.storage, &since, "commit").await?;
        let old = Commit::from_cbor(&old_bytes)?;
        if old.did() != head.commit.did() {
            return Err(crate::error::CommitError::DidMismatch {
                commit_did: old.did().to_string(),
                expected_did: head.commit.did().to_string(),
            }
            .into());
        }

        let delta = diff(&self.storage, Some(old.data), head.commit.data).await?;
        let commit_bytes = get_required(&*self.storage, &head.cid, "commit").await?;

        let mut blocks = Vec::with_capacity(delta.new_blocks.len() + 1);
        blocks.push((head.cid, commit_bytes));
        blocks.extend(delta.fetch_new_blocks(&*self.storage).await?);
        crate::car::write_car_bytes(head.cid, blocks).await
    }

    /// CAR proving the presence (or absence) of one record at the current commit
    ///
    /// Holds the commit, the MST nodes from the root to the key's position,
    /// and the record block if the key exists.
    pub async fn record_proof(&self, collection: &str, rkey: &str) -> Result<Vec<u8>> {
        let head = self.head();
        let key = format_smolstr!("{}/{}", collection, rkey);
        let path = self.mst_at(&head).cids_for_path(&key).await?;

        let mut blocks = Vec::with_capacity(path.len() + 1);
        blocks.push((head.cid, get_required(&*self.storage, &head.cid, "commit").await?));
        for cid in path {
            blocks.push((cid, get_required(&*self.storage, &cid, "proof").await?));
        }
        crate::car::write_car_bytes(head.cid, blocks).await
    }

    fn mst_at(&self, head: &Head) -> Mst<S> {
        Mst::load(self.storage.clone(), head.commit.data)
    }
}

impl<S: BlockStore> Display for Repository<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let head = self
            .head
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        write!(
            f,
            "Repository {{ did: {}, rev: {}, commit: {}, data: {} }}",
            head.commit.did, head.commit.rev, head.cid, head.commit.data
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RepoErrorKind;
    use crate::commit::KeyedSigner;
    use ipld_core::ipld::Ipld;
    use std::collections::BTreeMap;

    type TestSigner = KeyedSigner<ed25519_dalek::SigningKey>;

    fn signer() -> TestSigner {
        KeyedSigner::new(
            Did::new("did:plc:repotest").unwrap(),
            ed25519_dalek::SigningKey::from_bytes(&[42u8; 32]),
        )
    }

    fn post(text: &str) -> Value {
        let mut map = BTreeMap::new();
        map.insert("text".to_string(), Ipld::String(text.to_string()));
        Ipld::Map(map)
    }

    async fn new_repo() -> (Repository<MemoryBlockStore>, TestSigner) {
        let signer = signer();
        let repo = Repository::create(
            Arc::new(MemoryBlockStore::new()),
            &signer,
            RepoConfig::default(),
        )
        .await
        .unwrap();
        (repo, signer)
    }

    #[tokio::test]
    async fn test_create_repo() {
        let (repo, signer) = new_repo().await;
        let commit = repo.current_commit();
        assert_eq!(commit.did(), signer.did());
        assert!(commit.prev.is_none());
        assert!(repo.mst().is_empty().await.unwrap());
        assert!(commit.verify(&signer.verifying_key().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_write_and_read_records() {
        let (repo, signer) = new_repo().await;
        let data = repo
            .apply_writes(
                &[
                    RecordWrite::create("app.example.post", "a", post("first")),
                    RecordWrite::create("app.example.post", "b", post("second")),
                    RecordWrite::create("app.example.like", "c", post("like")),
                ],
                &signer,
            )
            .await
            .unwrap();

        assert_eq!(data.ops.len(), 3);
        assert_eq!(data.blocks[0].0, data.cid);
        assert_eq!(repo.current_commit_cid(), data.cid);
        assert_eq!(
            repo.get_record("app.example.post", "a").await.unwrap(),
            Some(post("first"))
        );
        assert_eq!(repo.get_record("app.example.post", "z").await.unwrap(), None);

        let posts = repo.list_records("app.example.post").await.unwrap();
        let rkeys: Vec<&str> = posts.iter().map(|(rkey, _)| rkey.as_str()).collect();
        assert_eq!(rkeys, ["a", "b"]);
    }

    #[tokio::test]
    async fn test_failed_batch_changes_nothing() {
        let (repo, signer) = new_repo().await;
        repo.apply_writes(&[RecordWrite::create("app.example.post", "a", post("x"))], &signer)
            .await
            .unwrap();
        let head = repo.current_commit_cid();
        let blocks_before = repo.storage().len();

        // second write is a create on an existing key
        let err = repo
            .apply_writes(
                &[
                    RecordWrite::create("app.example.post", "b", post("y")),
                    RecordWrite::create("app.example.post", "a", post("z")),
                ],
                &signer,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), &RepoErrorKind::InvalidWrite);
        assert_eq!(repo.current_commit_cid(), head);
        assert_eq!(repo.storage().len(), blocks_before);
    }

    #[tokio::test]
    async fn test_batch_validation() {
        let (repo, signer) = new_repo().await;

        let duplicate = [
            RecordWrite::create("app.example.post", "a", post("x")),
            RecordWrite::delete("app.example.post", "a"),
        ];
        let err = repo.apply_writes(&duplicate, &signer).await.unwrap_err();
        assert_eq!(err.kind(), &RepoErrorKind::InvalidWrite);

        let bad_key = [RecordWrite::create("app.example.post", "a/b", post("x"))];
        let err = repo.apply_writes(&bad_key, &signer).await.unwrap_err();
        assert_eq!(err.kind(), &RepoErrorKind::InvalidKey);

        let mut float = BTreeMap::new();
        float.insert("n".to_string(), Ipld::Float(0.5));
        let floats = [RecordWrite::create("app.example.post", "f", Ipld::Map(float))];
        let err = repo.apply_writes(&floats, &signer).await.unwrap_err();
        assert_eq!(err.kind(), &RepoErrorKind::InvalidWrite);
    }

    #[tokio::test]
    async fn test_limits() {
        let signer = signer();
        let config = RepoConfig::builder()
            .max_ops_per_commit(2)
            .max_record_size(64)
            .build();
        let repo = Repository::create(Arc::new(MemoryBlockStore::new()), &signer, config)
            .await
            .unwrap();

        let too_many: Vec<_> = (0..3)
            .map(|i| RecordWrite::create("app.example.post", format!("k{}", i), post("x")))
            .collect();
        let err = repo.apply_writes(&too_many, &signer).await.unwrap_err();
        assert_eq!(err.kind(), &RepoErrorKind::InvalidWrite);

        let big = [RecordWrite::create("app.example.post", "big", post(&"x".repeat(100)))];
        let err = repo.apply_writes(&big, &signer).await.unwrap_err();
        assert_eq!(err.kind(), &RepoErrorKind::InvalidWrite);
    }

    #[tokio::test]
    async fn test_swap_checks() {
        let (repo, signer) = new_repo().await;
        repo.apply_writes(&[RecordWrite::create("app.example.post", "a", post("x"))], &signer)
            .await
            .unwrap();
        let current = repo.get_record_cid("app.example.post", "a").await.unwrap().unwrap();
        let (wrong, _) = codec::cid_for(&post("something else")).unwrap();

        let err = repo
            .apply_writes(
                &[RecordWrite::update("app.example.post", "a", post("y")).with_swap(wrong)],
                &signer,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), &RepoErrorKind::InvalidWrite);

        let data = repo
            .apply_writes(
                &[RecordWrite::update("app.example.post", "a", post("y")).with_swap(current)],
                &signer,
            )
            .await
            .unwrap();
        assert_eq!(data.ops[0].prev, Some(current));
    }

    #[tokio::test]
    async fn test_commit_chain() {
        let (repo, signer) = new_repo().await;
        let mut prev_cid = repo.current_commit_cid();
        let mut prev_rev = repo.rev();

        for i in 0..5 {
            let data = repo
                .apply_writes(
                    &[RecordWrite::create("app.example.post", format!("{}", i), post("x"))],
                    &signer,
                )
                .await
                .unwrap();
            assert!(data.rev > prev_rev);
            assert_eq!(data.commit.prev, Some(prev_cid));
            assert_eq!(data.since.as_ref(), Some(&prev_rev));
            prev_cid = data.cid;
            prev_rev = data.rev;
        }
    }

    #[tokio::test]
    async fn test_try_apply_writes_busy() {
        let (repo, signer) = new_repo().await;
        let _guard = repo.writer_lock().lock().await;
        let err = repo
            .try_apply_writes(&[RecordWrite::create("app.example.post", "a", post("x"))], &signer)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), &RepoErrorKind::Busy);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_foreign_signer_rejected() {
        let (repo, _) = new_repo().await;
        let other = KeyedSigner::new(
            Did::new("did:plc:intruder").unwrap(),
            ed25519_dalek::SigningKey::from_bytes(&[1u8; 32]),
        );
        let err = repo
            .apply_writes(&[RecordWrite::create("app.example.post", "a", post("x"))], &other)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), &RepoErrorKind::Signing);
    }

    struct RefusingSigner(Did);

    impl Signer for RefusingSigner {
        fn did(&self) -> &Did {
            &self.0
        }

        fn sign(&self, _bytes: &[u8]) -> Result<Bytes> {
            Err(RepoError::signing("hardware key unavailable"))
        }
    }

    #[tokio::test]
    async fn test_signer_refusal_leaves_head() {
        let (repo, signer) = new_repo().await;
        repo.apply_writes(&[RecordWrite::create("app.example.post", "a", post("x"))], &signer)
            .await
            .unwrap();
        let head = repo.current_commit_cid();
        let rev = repo.rev();
        let blocks = repo.storage().len();

        let refusing = RefusingSigner(signer.did().clone());
        let err = repo
            .apply_writes(&[RecordWrite::create("app.example.post", "b", post("y"))], &refusing)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), &RepoErrorKind::Signing);

        assert_eq!(repo.current_commit_cid(), head);
        assert_eq!(repo.rev(), rev);
        assert_eq!(repo.storage().len(), blocks);
        assert_eq!(repo.get_record("app.example.post", "b").await.unwrap(), None);

        // the original signer still works afterwards
        repo.apply_writes(&[RecordWrite::create("app.example.post", "b", post("y"))], &signer)
            .await
            .unwrap();
        assert_ne!(repo.current_commit_cid(), head);
    }

    #[tokio::test]
    async fn test_load_from_storage() {
        let (repo, signer) = new_repo().await;
        let data = repo
            .apply_writes(&[RecordWrite::create("app.example.post", "a", post("x"))], &signer)
            .await
            .unwrap();

        let loaded = Repository::load(repo.storage().clone(), data.cid, RepoConfig::default())
            .await
            .unwrap();
        assert_eq!(loaded.current_commit(), data.commit);
        assert_eq!(
            loaded.get_record("app.example.post", "a").await.unwrap(),
            Some(post("x"))
        );

        let missing = codec::cid_for(&"nothing").unwrap().0;
        let err = Repository::load(repo.storage().clone(), missing, RepoConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), &RepoErrorKind::NotFound);
    }
}
