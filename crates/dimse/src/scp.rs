//! Service Class Provider (SCP) implementation for inbound C-STORE
//!
//! The listener is async; each accepted association is handed to a blocking
//! task because dicom-ul server associations are synchronous.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dicom_dictionary_std::tags;
use dicom_object::meta::FileMetaTableBuilder;
use dicom_object::{FileDicomObject, InMemDicomObject};
use dicom_encoding::TransferSyntaxIndex;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_ul::association::ServerAssociationOptions;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DimseConfig;
use crate::message::{decode_dataset, status_response, store_response, DimseChannel, DimseMessage, Incoming, PduIo, Wire};
use crate::types::{DimseCommand, VERIFICATION};
use crate::{DimseError, Result};

/// Status returned when the handler could not persist an object (Out of Resources)
pub const STATUS_OUT_OF_RESOURCES: u16 = 0xA700;

/// Status returned when the data set could not be decoded (Cannot Understand)
pub const STATUS_CANNOT_UNDERSTAND: u16 = 0xC000;

/// Status returned for requests this SCP does not serve
pub const STATUS_UNRECOGNIZED_OPERATION: u16 = 0x0211;

/// An object received through C-STORE
#[derive(Debug, Clone)]
pub struct ReceivedObject {
    pub calling_ae: String,
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    pub transfer_syntax: String,
    pub dataset: InMemDicomObject,
}

impl ReceivedObject {
    /// Attach a file meta group so the object can be written as a Part 10 file
    pub fn into_file_object(self) -> Result<FileDicomObject<InMemDicomObject>> {
        let meta = FileMetaTableBuilder::new()
            .media_storage_sop_class_uid(self.sop_class_uid.as_str())
            .media_storage_sop_instance_uid(self.sop_instance_uid.as_str())
            .transfer_syntax(self.transfer_syntax.as_str())
            .build()
            .map_err(|e| DimseError::DicomObject(e.to_string()))?;
        Ok(self.dataset.with_exact_meta(meta))
    }

    pub fn string(&self, tag: dicom_core::Tag) -> Option<String> {
        crate::types::string_value(&self.dataset, tag)
    }
}

/// Receives the objects stored by remote nodes
pub trait StoreHandler: Send + Sync {
    /// Persist one object; an error is reported to the peer as a failed store
    fn on_store(&self, object: ReceivedObject) -> Result<()>;
}

/// Storage SCP
pub struct StoreScp {
    config: DimseConfig,
    handler: Arc<dyn StoreHandler>,
}

impl StoreScp {
    pub fn new(config: DimseConfig, handler: Arc<dyn StoreHandler>) -> Self {
        Self { config, handler }
    }

    /// Bind the listener; the SCP is ready to accept once this returns
    pub async fn bind(self) -> Result<BoundStoreScp> {
        self.config.validate()?;
        let addr = SocketAddr::new(self.config.bind_addr, self.config.port);
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            "Storage SCP listening on {} (AET: {})",
            local_addr, self.config.local_aet
        );

        Ok(BoundStoreScp {
            listener,
            local_addr,
            config: Arc::new(self.config),
            handler: self.handler,
        })
    }
}

/// A storage SCP whose listener is bound
pub struct BoundStoreScp {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: Arc<DimseConfig>,
    handler: Arc<dyn StoreHandler>,
}

impl BoundStoreScp {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept associations until `shutdown` is cancelled, then wait for open
    /// associations to finish (bounded by the association timeout)
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let limit = Arc::new(Semaphore::new(self.config.max_associations as usize));
        let mut associations = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Storage SCP on {} stopping", self.local_addr);
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Error accepting connection: {}", e);
                            continue;
                        }
                    };
                    debug!("Accepted connection from {}", peer_addr);

                    let permit = match Arc::clone(&limit).try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!(
                                "Maximum associations reached, rejecting connection from {}",
                                peer_addr
                            );
                            continue;
                        }
                    };

                    let stream = match stream.into_std() {
                        Ok(stream) => stream,
                        Err(e) => {
                            error!("Could not detach connection from {}: {}", peer_addr, e);
                            continue;
                        }
                    };

                    let config = Arc::clone(&self.config);
                    let handler = Arc::clone(&self.handler);
                    associations.spawn_blocking(move || {
                        let _permit = permit;
                        if let Err(e) = handle_association(stream, peer_addr, &config, handler.as_ref()) {
                            error!("Error handling association from {}: {}", peer_addr, e);
                        }
                    });
                }
                Some(finished) = associations.join_next(), if !associations.is_empty() => {
                    if let Err(e) = finished {
                        error!("Association task failed: {}", e);
                    }
                }
            }
        }

        drop(self.listener);
        let drain = async {
            while let Some(finished) = associations.join_next().await {
                if let Err(e) = finished {
                    error!("Association task failed: {}", e);
                }
            }
        };
        if tokio::time::timeout(self.config.association_timeout(), drain).await.is_err() {
            warn!(
                "Storage SCP on {} stopped with associations still open",
                self.local_addr
            );
        }

        info!("Storage SCP on {} stopped", self.local_addr);
        Ok(())
    }
}

fn ul_error(e: impl std::fmt::Display) -> DimseError {
    DimseError::DicomUl(e.to_string())
}

fn handle_association(
    stream: std::net::TcpStream,
    peer_addr: SocketAddr,
    config: &DimseConfig,
    handler: &dyn StoreHandler,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_millis(config.association_timeout_ms)))?;

    let mut options = ServerAssociationOptions::new()
        .accept_any()
        .ae_title(config.local_aet.as_str())
        .strict(false)
        .max_pdu_length(config.max_pdu)
        .promiscuous(true)
        .with_abstract_syntax(VERIFICATION);
    for ts in TransferSyntaxRegistry.iter() {
        if !ts.is_unsupported() {
            options = options.with_transfer_syntax(ts.uid());
        }
    }

    let association = options.establish(stream).map_err(ul_error)?;
    let calling_ae = association.client_ae_title().trim().to_string();
    let contexts: Vec<(u8, String)> = association
        .presentation_contexts()
        .iter()
        .map(|pc| (pc.id, pc.transfer_syntax.trim_end_matches('\0').to_string()))
        .collect();
    // Responses are bounded by what the requestor announced, not by our own limit
    let outbound_pdu = association.requestor_max_pdu_length();
    info!("New association from {} ({})", calling_ae, peer_addr);

    let io = PduIo::new(
        association,
        |a, pdu| a.send(pdu).map_err(ul_error),
        |a| a.receive().map_err(ul_error),
    );
    let mut channel = DimseChannel::new(io, outbound_pdu);
    let mut stored = 0usize;

    loop {
        let message = match channel.read_message()? {
            Incoming::Message(message) => message,
            Incoming::Release => {
                if let Err(e) = channel.wire_mut().send_pdu(&dicom_ul::Pdu::ReleaseRP) {
                    warn!("Failed to confirm release to {}: {}", calling_ae, e);
                }
                info!("Released association with {} ({} objects)", calling_ae, stored);
                return Ok(());
            }
            Incoming::Abort => {
                warn!("Association aborted by {} ({} objects)", calling_ae, stored);
                return Ok(());
            }
        };

        let transfer_syntax = contexts
            .iter()
            .find(|(id, _)| *id == message.presentation_context_id)
            .map(|(_, ts)| ts.clone());

        let response = match message.command_field().and_then(DimseCommand::from_request_field) {
            Some(DimseCommand::Echo) => {
                debug!("C-ECHO from {}", calling_ae);
                status_response(
                    DimseCommand::Echo.response_field(),
                    message.message_id().unwrap_or(0),
                    Some(VERIFICATION),
                    0x0000,
                    false,
                )
            }
            Some(DimseCommand::Store) => {
                let (response, ok) = handle_store(&message, transfer_syntax, &calling_ae, handler);
                if ok {
                    stored += 1;
                }
                response
            }
            other => {
                warn!("Unsupported request {:?} from {}", other, calling_ae);
                let field = message.command_field().unwrap_or(0) | 0x8000;
                status_response(
                    field,
                    message.message_id().unwrap_or(0),
                    None,
                    STATUS_UNRECOGNIZED_OPERATION,
                    false,
                )
            }
        };

        channel.send_message(message.presentation_context_id, &response, None)?;
    }
}

fn handle_store(
    message: &DimseMessage,
    transfer_syntax: Option<String>,
    calling_ae: &str,
    handler: &dyn StoreHandler,
) -> (InMemDicomObject, bool) {
    let message_id = message.message_id().unwrap_or(0);
    let sop_class_uid = message.string(tags::AFFECTED_SOP_CLASS_UID).unwrap_or_default();
    let sop_instance_uid = message.string(tags::AFFECTED_SOP_INSTANCE_UID).unwrap_or_default();
    let respond = |status| store_response(message_id, &sop_class_uid, &sop_instance_uid, status);

    let (Some(data), Some(transfer_syntax)) = (message.data.as_deref(), transfer_syntax) else {
        warn!("C-STORE from {} without data set or context", calling_ae);
        return (respond(STATUS_CANNOT_UNDERSTAND), false);
    };

    let dataset = match decode_dataset(data, &transfer_syntax) {
        Ok(dataset) => dataset,
        Err(e) => {
            warn!("Could not decode {} from {}: {}", sop_instance_uid, calling_ae, e);
            return (respond(STATUS_CANNOT_UNDERSTAND), false);
        }
    };

    let object = ReceivedObject {
        calling_ae: calling_ae.to_string(),
        sop_class_uid: sop_class_uid.clone(),
        sop_instance_uid: sop_instance_uid.clone(),
        transfer_syntax,
        dataset,
    };

    match handler.on_store(object) {
        Ok(()) => {
            debug!("Stored {} from {}", sop_instance_uid, calling_ae);
            (respond(0x0000), true)
        }
        Err(e) => {
            error!("Failed to store {} from {}: {}", sop_instance_uid, calling_ae, e);
            (respond(STATUS_OUT_OF_RESOURCES), false)
        }
    }
}
