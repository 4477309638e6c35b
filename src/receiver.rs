//! Inbound receiver: a storage SCP that files pushed objects by subject and session

use dicom_dictionary_std::tags;
use dimse::scp::ReceivedObject;
use dimse::{DimseConfig, DimseError, StoreHandler, StoreScp};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Result;

pub const UNKNOWN_SUBJECT: &str = "UNKNOWN_SUBJECT";
pub const UNKNOWN_SESSION: &str = "UNKNOWN_SESSION";

/// Writes received objects to `<root>/<subject>/<session>/<SOPInstanceUID>.dcm`
struct ReceiverWriter {
    root: PathBuf,
    received: Arc<AtomicUsize>,
}

impl ReceiverWriter {
    fn destination(&self, object: &ReceivedObject) -> PathBuf {
        self.root
            .join(subject_for(object))
            .join(session_for(object))
            .join(format!("{}.dcm", sanitize_segment(&object.sop_instance_uid)))
    }
}

impl StoreHandler for ReceiverWriter {
    fn on_store(&self, object: ReceivedObject) -> dimse::Result<()> {
        let path = self.destination(&object);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let calling_ae = object.calling_ae.clone();
        object
            .into_file_object()?
            .write_to_file(&path)
            .map_err(|e| DimseError::DicomObject(format!("{}: {}", path.display(), e)))?;

        self.received.fetch_add(1, Ordering::SeqCst);
        debug!("Stored object from {} at {}", calling_ae, path.display());
        Ok(())
    }
}

/// Subject directory: normalised patient name, else patient ID, else study UID
pub fn subject_for(object: &ReceivedObject) -> String {
    let subject = object
        .string(tags::PATIENT_NAME)
        .and_then(|name| normalize_person_name(&name))
        .or_else(|| object.string(tags::PATIENT_ID))
        .or_else(|| object.string(tags::STUDY_INSTANCE_UID))
        .unwrap_or_else(|| UNKNOWN_SUBJECT.to_string());
    sanitize_segment(&subject)
}

/// Session directory: series description, else a placeholder
pub fn session_for(object: &ReceivedObject) -> String {
    let session = object
        .string(tags::SERIES_DESCRIPTION)
        .unwrap_or_else(|| UNKNOWN_SESSION.to_string());
    sanitize_segment(&session)
}

/// `Family^Given^...` becomes `g_family`
fn normalize_person_name(name: &str) -> Option<String> {
    let mut components = name.split('^').map(str::trim);
    let family = components.next().unwrap_or_default();
    let given = components.next().unwrap_or_default();

    let normalized = match (family.is_empty(), given.chars().next()) {
        (false, Some(initial)) => format!("{}_{}", initial, family),
        (false, None) => family.to_string(),
        (true, Some(_)) => given.to_string(),
        (true, None) => return None,
    };
    Some(normalized.to_lowercase())
}

/// Make `value` safe to use as a single path segment
pub fn sanitize_segment(value: &str) -> String {
    let sanitized: String = value
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() || sanitized.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        sanitized
    }
}

pub struct InboundReceiver;

impl InboundReceiver {
    /// Bind the storage SCP and start accepting in the background.
    ///
    /// Returns once the listener is bound, so callers may issue C-MOVE
    /// requests immediately.
    pub async fn start(config: DimseConfig, output_root: &Path) -> Result<ReceiverSession> {
        std::fs::create_dir_all(output_root)?;

        let received = Arc::new(AtomicUsize::new(0));
        let writer = Arc::new(ReceiverWriter {
            root: output_root.to_path_buf(),
            received: Arc::clone(&received),
        });

        let ae_title = config.local_aet.clone();
        let scp = StoreScp::new(config, writer).bind().await?;
        let port = scp.local_addr().port();

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move { scp.serve(token).await });

        info!(
            "📥 Receiver {} listening on port {}, writing to {}",
            ae_title,
            port,
            output_root.display()
        );

        Ok(ReceiverSession {
            port,
            ae_title,
            output_root: output_root.to_path_buf(),
            received,
            shutdown,
            task: Some(task),
        })
    }
}

/// A running receiver; dropped sessions stop accepting but are not joined
pub struct ReceiverSession {
    port: u16,
    ae_title: String,
    output_root: PathBuf,
    received: Arc<AtomicUsize>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<dimse::Result<()>>>,
}

impl ReceiverSession {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ae_title(&self) -> &str {
        &self.ae_title
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    pub fn running(&self) -> bool {
        !self.shutdown.is_cancelled() && self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Objects written so far
    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }

    /// Signal the listener to stop and wait for it; returns the number of
    /// objects received
    pub async fn stop(mut self) -> Result<usize> {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await? {
                warn!("Receiver {} stopped with error: {}", self.ae_title, e);
            }
        }
        let received = self.received.load(Ordering::SeqCst);
        info!("Receiver {} stopped after {} objects", self.ae_title, received);
        Ok(received)
    }
}

impl Drop for ReceiverSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
