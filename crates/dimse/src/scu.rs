//! Service Class User (SCU) implementation for outbound DIMSE operations
//!
//! dicom-ul associations are blocking, so every association lives on its own
//! thread and is driven through a request channel. [`ScuAssociation`] is the
//! async handle to that thread.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dicom_dictionary_std::tags;
use dicom_ul::association::ClientAssociationOptions;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::association::{Association, AssociationFactory};
use crate::config::{DimseConfig, RemoteNode};
use crate::message::{
    command_u16, decode_dataset, encode_dataset, find_request, move_request, store_request,
    DimseChannel, DimseMessage, Incoming, PduIo, Wire,
};
use crate::types::{
    DimseCommand, DimseStatus, FindOutcome, FindQuery, MoveOutcome, MovePriority, MoveQuery,
    PresentationContext, EXPLICIT_VR_LE, IMPLICIT_VR_LE, STUDY_ROOT_FIND, STUDY_ROOT_MOVE,
};
use crate::{DimseError, Result};

/// Explicit VR Big Endian (retired, still found in old archives)
const EXPLICIT_VR_BE: &str = "1.2.840.10008.1.2.2";

/// DIMSE Service Class User
#[derive(Debug, Clone)]
pub struct DimseScu {
    config: DimseConfig,
}

impl DimseScu {
    /// Create a new SCU with the given configuration
    pub fn new(config: DimseConfig) -> Self {
        Self { config }
    }

    pub fn local_aet(&self) -> &str {
        &self.config.local_aet
    }

    /// Get maximum PDU size for a node (uses node-specific or global setting)
    fn get_max_pdu(&self, node: &RemoteNode) -> u32 {
        node.max_pdu.unwrap_or(self.config.max_pdu)
    }
}

#[async_trait]
impl AssociationFactory for DimseScu {
    async fn associate(
        &self,
        node: &RemoteNode,
        contexts: Vec<PresentationContext>,
    ) -> Result<Box<dyn Association>> {
        node.validate()?;
        if contexts.is_empty() {
            return Err(DimseError::config("at least one presentation context is required"));
        }

        info!(
            "Opening association {} -> {} ({} presentation contexts)",
            self.config.local_aet,
            node,
            contexts.len()
        );

        let (ready_tx, ready_rx) = oneshot::channel();
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let setup = AssociationSetup {
            local_aet: self.config.local_aet.clone(),
            node: node.clone(),
            max_pdu: self.get_max_pdu(node),
            contexts,
        };

        std::thread::Builder::new()
            .name(format!("dimse-scu-{}", node.ae_title))
            .spawn(move || run_association(setup, ready_tx, request_rx))?;

        ready_rx
            .await
            .map_err(|_| DimseError::internal("association thread exited during setup"))??;

        Ok(Box::new(ScuAssociation {
            peer: node.to_string(),
            requests: request_tx,
        }))
    }
}

enum Request {
    Find(FindQuery, oneshot::Sender<Result<FindOutcome>>),
    Move(MoveQuery, oneshot::Sender<Result<MoveOutcome>>),
    Store(PathBuf, oneshot::Sender<Result<DimseStatus>>),
    Release(oneshot::Sender<Result<()>>),
}

/// Async handle to an association owned by a dedicated thread
pub struct ScuAssociation {
    peer: String,
    requests: mpsc::UnboundedSender<Request>,
}

impl ScuAssociation {
    async fn call<T>(&self, request: impl FnOnce(oneshot::Sender<Result<T>>) -> Request) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(request(tx))
            .map_err(|_| DimseError::AssociationClosed(format!("association with {} is gone", self.peer)))?;
        rx.await
            .map_err(|_| DimseError::AssociationClosed(format!("association with {} ended", self.peer)))?
    }
}

#[async_trait]
impl Association for ScuAssociation {
    async fn find(&mut self, query: &FindQuery) -> Result<FindOutcome> {
        let query = query.clone();
        self.call(move |tx| Request::Find(query, tx)).await
    }

    async fn move_request(&mut self, query: &MoveQuery) -> Result<MoveOutcome> {
        let query = query.clone();
        self.call(move |tx| Request::Move(query, tx)).await
    }

    async fn store_file(&mut self, path: &Path) -> Result<DimseStatus> {
        let path = path.to_path_buf();
        self.call(move |tx| Request::Store(path, tx)).await
    }

    async fn release(self: Box<Self>) -> Result<()> {
        self.call(Request::Release).await
    }
}

struct AssociationSetup {
    local_aet: String,
    node: RemoteNode,
    max_pdu: u32,
    contexts: Vec<PresentationContext>,
}

fn ul_error(e: impl std::fmt::Display) -> DimseError {
    DimseError::DicomUl(e.to_string())
}

fn run_association(
    setup: AssociationSetup,
    ready: oneshot::Sender<Result<()>>,
    mut requests: mpsc::UnboundedReceiver<Request>,
) {
    let mut options = ClientAssociationOptions::new()
        .calling_ae_title(setup.local_aet.as_str())
        .called_ae_title(setup.node.ae_title.as_str())
        .max_pdu_length(setup.max_pdu);
    for context in &setup.contexts {
        options = options.with_presentation_context(
            context.abstract_syntax.as_str(),
            context.transfer_syntaxes.iter().map(String::as_str).collect(),
        );
    }

    let association = match options.establish(setup.node.address()) {
        Ok(association) => association,
        Err(e) => {
            let _ = ready.send(Err(DimseError::AssociationRejected(format!(
                "{}: {}",
                setup.node, e
            ))));
            return;
        }
    };

    let accepted = accepted_contexts(
        &setup.contexts,
        association
            .presentation_contexts()
            .iter()
            .map(|pc| (pc.id, pc.transfer_syntax.to_string())),
    );
    debug!("Accepted presentation contexts with {}: {:?}", setup.node, accepted);
    let max_pdu = association.acceptor_max_pdu_length();

    let io = PduIo::new(
        association,
        |a, pdu| a.send(pdu).map_err(ul_error),
        |a| a.receive().map_err(ul_error),
    );
    let mut session = Session::new(DimseChannel::new(io, max_pdu), accepted, setup.node.to_string());
    let _ = ready.send(Ok(()));

    while let Some(request) = requests.blocking_recv() {
        let lost = match request {
            Request::Find(query, reply) => {
                let result = session.find(&query);
                let lost = association_lost(&result);
                let _ = reply.send(result);
                lost
            }
            Request::Move(query, reply) => {
                let result = session.move_request(&query);
                let lost = association_lost(&result);
                let _ = reply.send(result);
                lost
            }
            Request::Store(path, reply) => {
                let result = session.store_file(&path);
                let lost = association_lost(&result);
                let _ = reply.send(result);
                lost
            }
            Request::Release(reply) => {
                let result = session.into_wire().into_inner().release().map_err(ul_error);
                info!("Released association with {}", setup.node);
                let _ = reply.send(result);
                return;
            }
        };
        if lost {
            warn!("Association with {} lost", setup.node);
            return;
        }
    }

    // the handle was dropped without an explicit release
    if let Err(e) = session.into_wire().into_inner().release() {
        debug!("Implicit release of association with {} failed: {}", setup.node, e);
    }
}

fn association_lost<T>(result: &Result<T>) -> bool {
    matches!(result, Err(e) if e.is_association_lost())
}

/// A presentation context the peer accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AcceptedContext {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntax: String,
}

/// Contexts are proposed with ids 1, 3, 5, ... in request order
pub(crate) fn accepted_contexts(
    proposed: &[PresentationContext],
    negotiated: impl IntoIterator<Item = (u8, String)>,
) -> Vec<AcceptedContext> {
    negotiated
        .into_iter()
        .filter_map(|(id, transfer_syntax)| {
            let index = (id as usize).checked_sub(1)? / 2;
            proposed.get(index).map(|context| AcceptedContext {
                id,
                abstract_syntax: context.abstract_syntax.clone(),
                transfer_syntax: transfer_syntax.trim_end_matches('\0').to_string(),
            })
        })
        .collect()
}

fn is_native_uncompressed(transfer_syntax: &str) -> bool {
    matches!(transfer_syntax, IMPLICIT_VR_LE | EXPLICIT_VR_LE | EXPLICIT_VR_BE)
}

/// The DIMSE exchanges of one association, independent of the transport
pub(crate) struct Session<W> {
    channel: DimseChannel<W>,
    contexts: Vec<AcceptedContext>,
    next_message_id: u16,
    peer: String,
}

impl<W: Wire> Session<W> {
    pub fn new(channel: DimseChannel<W>, contexts: Vec<AcceptedContext>, peer: String) -> Self {
        Self {
            channel,
            contexts,
            next_message_id: 1,
            peer,
        }
    }

    pub fn into_wire(self) -> W {
        self.channel.into_wire()
    }

    fn message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1).max(1);
        id
    }

    fn context_for(&self, abstract_syntax: &str) -> Result<AcceptedContext> {
        self.contexts
            .iter()
            .find(|c| c.abstract_syntax == abstract_syntax)
            .cloned()
            .ok_or_else(|| DimseError::NoPresentationContext(abstract_syntax.to_string()))
    }

    fn read_response(&mut self, command: DimseCommand) -> Result<DimseMessage> {
        match self.channel.read_message()? {
            Incoming::Message(message) => {
                if message.command_field() != Some(command.response_field()) {
                    return Err(DimseError::DicomParsing(format!(
                        "expected response 0x{:04X} from {}, got {:?}",
                        command.response_field(),
                        self.peer,
                        message.command_field()
                    )));
                }
                Ok(message)
            }
            Incoming::Release => Err(DimseError::AssociationClosed(format!(
                "{} released the association",
                self.peer
            ))),
            Incoming::Abort => Err(DimseError::AssociationClosed(format!(
                "{} aborted the association",
                self.peer
            ))),
        }
    }

    pub fn find(&mut self, query: &FindQuery) -> Result<FindOutcome> {
        let context = self.context_for(STUDY_ROOT_FIND)?;
        let message_id = self.message_id();
        let identifier = encode_dataset(&query.identifier(), &context.transfer_syntax)?;

        debug!("C-FIND-RQ {} to {} (level {})", message_id, self.peer, query.query_level);
        self.channel.send_message(
            context.id,
            &find_request(message_id, STUDY_ROOT_FIND, query.priority),
            Some(&identifier),
        )?;

        let mut matches = Vec::new();
        loop {
            let response = self.read_response(DimseCommand::Find)?;
            let status = response.status();
            if !status.is_pending() {
                debug!("C-FIND {} finished with {} and {} matches", message_id, status, matches.len());
                return Ok(FindOutcome { status, matches });
            }
            if let Some(data) = &response.data {
                match decode_dataset(data, &context.transfer_syntax) {
                    Ok(identifier) => matches.push(identifier),
                    Err(e) => warn!("Skipping undecodable C-FIND match from {}: {}", self.peer, e),
                }
            }
        }
    }

    pub fn move_request(&mut self, query: &MoveQuery) -> Result<MoveOutcome> {
        let context = self.context_for(STUDY_ROOT_MOVE)?;
        let message_id = self.message_id();
        let identifier = encode_dataset(&query.identifier(), &context.transfer_syntax)?;

        debug!(
            "C-MOVE-RQ {} to {} (destination {})",
            message_id, self.peer, query.destination_aet
        );
        self.channel.send_message(
            context.id,
            &move_request(message_id, STUDY_ROOT_MOVE, query.priority, &query.destination_aet),
            Some(&identifier),
        )?;

        let mut outcome = MoveOutcome {
            status: DimseStatus::Pending(0xFF00),
            completed: 0,
            failed: 0,
            warning: 0,
        };
        loop {
            let response = self.read_response(DimseCommand::Move)?;
            let count = |tag| command_u16(&response.command, tag);
            outcome.status = response.status();
            outcome.completed = count(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS).unwrap_or(outcome.completed);
            outcome.failed = count(tags::NUMBER_OF_FAILED_SUBOPERATIONS).unwrap_or(outcome.failed);
            outcome.warning = count(tags::NUMBER_OF_WARNING_SUBOPERATIONS).unwrap_or(outcome.warning);
            if !outcome.status.is_pending() {
                debug!("C-MOVE {} finished with {}", message_id, outcome.status);
                return Ok(outcome);
            }
        }
    }

    pub fn store_file(&mut self, path: &Path) -> Result<DimseStatus> {
        let file = dicom_object::open_file(path)
            .map_err(|e| DimseError::DicomObject(format!("{}: {}", path.display(), e)))?;
        let meta = file.meta();
        let sop_class_uid = meta.media_storage_sop_class_uid.trim_end_matches('\0').to_string();
        let sop_instance_uid = meta.media_storage_sop_instance_uid.trim_end_matches('\0').to_string();
        let file_syntax = meta.transfer_syntax.trim_end_matches('\0').to_string();

        let context = self.context_for(&sop_class_uid)?;
        if context.transfer_syntax != file_syntax
            && !(is_native_uncompressed(&file_syntax) && is_native_uncompressed(&context.transfer_syntax))
        {
            return Err(DimseError::operation_failed(format!(
                "{} is encoded in {} but {} accepted only {}",
                path.display(),
                file_syntax,
                self.peer,
                context.transfer_syntax
            )));
        }
        let dataset = encode_dataset(&file, &context.transfer_syntax)?;

        let message_id = self.message_id();
        debug!("C-STORE-RQ {} to {} for {}", message_id, self.peer, sop_instance_uid);
        self.channel.send_message(
            context.id,
            &store_request(message_id, &sop_class_uid, &sop_instance_uid, MovePriority::Medium),
            Some(&dataset),
        )?;

        let response = self.read_response(DimseCommand::Store)?;
        Ok(response.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::status_response;
    use crate::message::tests::{peer_message, ScriptedWire};
    use crate::types::QueryLevel;
    use dicom_core::{DataElement, PrimitiveValue, VR};
    use dicom_object::meta::FileMetaTableBuilder;
    use dicom_object::InMemDicomObject;
    use dicom_ul::Pdu;

    const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";

    fn session(inbound: Vec<Pdu>, contexts: Vec<AcceptedContext>) -> Session<ScriptedWire> {
        let wire = ScriptedWire {
            inbound: inbound.into(),
            sent: Vec::new(),
        };
        Session::new(DimseChannel::new(wire, 16384), contexts, "PACS@test:104".to_string())
    }

    fn context(id: u8, abstract_syntax: &str) -> AcceptedContext {
        AcceptedContext {
            id,
            abstract_syntax: abstract_syntax.to_string(),
            transfer_syntax: IMPLICIT_VR_LE.to_string(),
        }
    }

    fn study_match(uid: &str) -> Vec<u8> {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::from(uid)));
        encode_dataset(&obj, IMPLICIT_VR_LE).unwrap()
    }

    #[test]
    fn test_accepted_contexts_map_by_proposal_order() {
        let proposed = vec![
            PresentationContext::uncompressed(STUDY_ROOT_FIND),
            PresentationContext::uncompressed(STUDY_ROOT_MOVE),
        ];
        let accepted = accepted_contexts(&proposed, vec![(3, format!("{}\0", EXPLICIT_VR_LE))]);
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].abstract_syntax, STUDY_ROOT_MOVE);
        assert_eq!(accepted[0].transfer_syntax, EXPLICIT_VR_LE);
    }

    #[test]
    fn test_find_collects_pending_matches() {
        let mut inbound = Vec::new();
        for uid in ["1.2.3.1", "1.2.3.2"] {
            let pending = status_response(0x8020, 1, Some(STUDY_ROOT_FIND), 0xFF00, true);
            inbound.extend(peer_message(1, &pending, Some(&study_match(uid)), 16384));
        }
        let done = status_response(0x8020, 1, Some(STUDY_ROOT_FIND), 0x0000, false);
        inbound.extend(peer_message(1, &done, None, 16384));

        let mut session = session(inbound, vec![context(1, STUDY_ROOT_FIND)]);
        let query = FindQuery::new(QueryLevel::Study).with_key(tags::ACCESSION_NUMBER, VR::SH, "A1");
        let outcome = session.find(&query).unwrap();

        assert!(outcome.status.is_success());
        assert_eq!(outcome.matches.len(), 2);
        // request command + identifier
        assert_eq!(session.into_wire().sent.len(), 2);
    }

    #[test]
    fn test_move_reports_final_counts() {
        let mut inbound = Vec::new();
        inbound.extend(peer_message(
            1,
            &status_response(0x8021, 1, Some(STUDY_ROOT_MOVE), 0xFF00, false),
            None,
            16384,
        ));
        let mut done = status_response(0x8021, 1, Some(STUDY_ROOT_MOVE), 0x0000, false);
        done.put(DataElement::new(
            tags::NUMBER_OF_COMPLETED_SUBOPERATIONS,
            VR::US,
            PrimitiveValue::from(12_u16),
        ));
        inbound.extend(peer_message(1, &done, None, 16384));

        let mut session = session(inbound, vec![context(1, STUDY_ROOT_MOVE)]);
        let outcome = session
            .move_request(&MoveQuery::series("1.2.3", "1.2.3.4", "DCMCAT"))
            .unwrap();
        assert!(outcome.status.is_success());
        assert_eq!(outcome.completed, 12);
        assert_eq!(outcome.failed, 0);
    }

    #[test]
    fn test_move_without_context_fails() {
        let mut session = session(Vec::new(), vec![context(1, STUDY_ROOT_FIND)]);
        let err = session
            .move_request(&MoveQuery::series("1.2.3", "1.2.3.4", "DCMCAT"))
            .unwrap_err();
        assert!(matches!(err, DimseError::NoPresentationContext(_)));
    }

    #[test]
    fn test_peer_abort_is_association_loss() {
        let mut session = session(
            vec![Pdu::AbortRQ {
                source: dicom_ul::pdu::AbortRQSource::ServiceUser,
            }],
            vec![context(1, STUDY_ROOT_FIND)],
        );
        let err = session.find(&FindQuery::new(QueryLevel::Study)).unwrap_err();
        assert!(err.is_association_lost());
    }

    #[test]
    fn test_store_file_sends_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.dcm");
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(tags::SOP_CLASS_UID, VR::UI, PrimitiveValue::from(CT_IMAGE_STORAGE)));
        obj.put(DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from("1.2.3.4.5.6")));
        obj.put(DataElement::new(tags::PATIENT_ID, VR::LO, PrimitiveValue::from("P01")));
        obj.with_meta(
            FileMetaTableBuilder::new()
                .media_storage_sop_class_uid(CT_IMAGE_STORAGE)
                .media_storage_sop_instance_uid("1.2.3.4.5.6")
                .transfer_syntax(EXPLICIT_VR_LE),
        )
        .unwrap()
        .write_to_file(&path)
        .unwrap();

        let response = crate::message::store_response(1, CT_IMAGE_STORAGE, "1.2.3.4.5.6", 0x0000);
        let inbound = peer_message(5, &response, None, 16384);
        // accepted as implicit VR LE: re-encoded on the fly
        let mut session = session(inbound, vec![context(5, CT_IMAGE_STORAGE)]);

        let status = session.store_file(&path).unwrap();
        assert!(status.is_success());
        let sent = session.into_wire().sent;
        assert_eq!(sent.len(), 2);
        match &sent[1] {
            Pdu::PData { data } => {
                assert_eq!(data[0].presentation_context_id, 5);
                let decoded = decode_dataset(&data[0].data, IMPLICIT_VR_LE).unwrap();
                assert_eq!(
                    crate::types::string_value(&decoded, tags::PATIENT_ID).as_deref(),
                    Some("P01")
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_store_rejects_unconvertible_syntax() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jpeg.dcm");
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from("1.2.3.9")));
        obj.with_meta(
            FileMetaTableBuilder::new()
                .media_storage_sop_class_uid(CT_IMAGE_STORAGE)
                .media_storage_sop_instance_uid("1.2.3.9")
                .transfer_syntax("1.2.840.10008.1.2.4.50"),
        )
        .unwrap()
        .write_to_file(&path)
        .unwrap();

        let mut session = session(Vec::new(), vec![context(1, CT_IMAGE_STORAGE)]);
        let err = session.store_file(&path).unwrap_err();
        assert!(matches!(err, DimseError::OperationFailed(_)));
        assert!(session.into_wire().sent.is_empty());
    }
}
