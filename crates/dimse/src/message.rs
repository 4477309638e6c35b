//! DIMSE message framing on top of the upper layer PDU exchange
//!
//! Command sets are always encoded in Implicit VR Little Endian. Data sets are
//! carried as opaque bytes in whatever transfer syntax the presentation context
//! negotiated; callers decode them with [`decode_dataset`].

use std::collections::VecDeque;

use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_encoding::TransferSyntaxIndex;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_ul::pdu::{PDataValue, PDataValueType};
use dicom_ul::Pdu;

use crate::types::{DimseCommand, DimseStatus, MovePriority};
use crate::{DimseError, Result};

/// CommandDataSetType value meaning "no data set follows"
pub const NO_DATASET: u16 = 0x0101;

/// CommandDataSetType value used when a data set follows
const DATASET_PRESENT: u16 = 0x0000;

/// Room kept free in every P-DATA-TF for the PDU and PDV item headers
const PDU_OVERHEAD: usize = 16;

/// Fragment size used when the peer does not announce a maximum PDU length
const UNLIMITED_PDU_FRAGMENT: usize = 65536;

/// Raw PDU transport, implemented over dicom-ul associations and test doubles
pub trait Wire {
    fn send_pdu(&mut self, pdu: &Pdu) -> Result<()>;
    fn receive_pdu(&mut self) -> Result<Pdu>;
}

/// Adapts an association value plus its send/receive functions to [`Wire`].
///
/// Client and server associations of dicom-ul expose the same `send` and
/// `receive` methods without a shared trait, so the two operations are
/// captured as closures.
pub struct PduIo<A, S, R> {
    association: A,
    send: S,
    receive: R,
}

impl<A, S, R> PduIo<A, S, R>
where
    S: Fn(&mut A, &Pdu) -> Result<()>,
    R: Fn(&mut A) -> Result<Pdu>,
{
    pub fn new(association: A, send: S, receive: R) -> Self {
        Self {
            association,
            send,
            receive,
        }
    }
}

impl<A, S, R> PduIo<A, S, R> {
    pub fn association(&self) -> &A {
        &self.association
    }

    pub fn into_inner(self) -> A {
        self.association
    }
}

impl<A, S, R> Wire for PduIo<A, S, R>
where
    S: Fn(&mut A, &Pdu) -> Result<()>,
    R: Fn(&mut A) -> Result<Pdu>,
{
    fn send_pdu(&mut self, pdu: &Pdu) -> Result<()> {
        (self.send)(&mut self.association, pdu)
    }

    fn receive_pdu(&mut self) -> Result<Pdu> {
        (self.receive)(&mut self.association)
    }
}

/// A complete DIMSE message: command set plus optional encoded data set
#[derive(Debug, Clone)]
pub struct DimseMessage {
    pub presentation_context_id: u8,
    pub command: InMemDicomObject,
    pub data: Option<Vec<u8>>,
}

impl DimseMessage {
    pub fn command_field(&self) -> Option<u16> {
        command_u16(&self.command, tags::COMMAND_FIELD)
    }

    pub fn message_id(&self) -> Option<u16> {
        command_u16(&self.command, tags::MESSAGE_ID)
    }

    pub fn responded_message_id(&self) -> Option<u16> {
        command_u16(&self.command, tags::MESSAGE_ID_BEING_RESPONDED_TO)
    }

    /// Status of a response message; a response without a status is a failure
    pub fn status(&self) -> DimseStatus {
        command_u16(&self.command, tags::STATUS)
            .map(DimseStatus::from_code)
            .unwrap_or(DimseStatus::Failure(0xFFFF))
    }

    pub fn has_dataset(&self) -> bool {
        command_has_dataset(&self.command)
    }

    pub fn string(&self, tag: Tag) -> Option<String> {
        crate::types::string_value(&self.command, tag)
    }
}

/// What the peer sent next
#[derive(Debug)]
pub enum Incoming {
    Message(DimseMessage),
    Release,
    Abort,
}

enum Next {
    Value(PDataValue),
    Release,
    Abort,
}

/// Reassembles and fragments DIMSE messages over a [`Wire`]
pub struct DimseChannel<W> {
    wire: W,
    pending: VecDeque<PDataValue>,
    max_pdu: u32,
}

impl<W: Wire> DimseChannel<W> {
    /// `max_pdu` is the largest PDU the peer accepts; zero means unlimited
    pub fn new(wire: W, max_pdu: u32) -> Self {
        Self {
            wire,
            pending: VecDeque::new(),
            max_pdu,
        }
    }

    pub fn wire_mut(&mut self) -> &mut W {
        &mut self.wire
    }

    pub fn into_wire(self) -> W {
        self.wire
    }

    /// Send a command set and, if given, its encoded data set
    pub fn send_message(
        &mut self,
        presentation_context_id: u8,
        command: &InMemDicomObject,
        data: Option<&[u8]>,
    ) -> Result<()> {
        let command_bytes = encode_command(command)?;
        self.send_fragments(presentation_context_id, true, &command_bytes)?;
        if let Some(data) = data {
            self.send_fragments(presentation_context_id, false, data)?;
        }
        Ok(())
    }

    /// Read the next complete message, or the release/abort that ended the association
    pub fn read_message(&mut self) -> Result<Incoming> {
        let mut command_bytes = Vec::new();
        let presentation_context_id = loop {
            let value = match self.next_value()? {
                Next::Value(value) => value,
                Next::Release => return Ok(Incoming::Release),
                Next::Abort => return Ok(Incoming::Abort),
            };
            match value.value_type {
                PDataValueType::Command => {
                    command_bytes.extend_from_slice(&value.data);
                    if value.is_last {
                        break value.presentation_context_id;
                    }
                }
                PDataValueType::Data => {
                    return Err(DimseError::DicomParsing(
                        "data fragment received before its command set".to_string(),
                    ));
                }
            }
        };

        let command = decode_command(&command_bytes)?;
        let mut message = DimseMessage {
            presentation_context_id,
            command,
            data: None,
        };

        if message.has_dataset() {
            let mut data = Vec::new();
            loop {
                let value = match self.next_value()? {
                    Next::Value(value) => value,
                    Next::Release | Next::Abort => {
                        return Err(DimseError::AssociationClosed(
                            "association ended in the middle of a data set".to_string(),
                        ));
                    }
                };
                match value.value_type {
                    PDataValueType::Data => {
                        data.extend_from_slice(&value.data);
                        if value.is_last {
                            break;
                        }
                    }
                    PDataValueType::Command => {
                        return Err(DimseError::DicomParsing(
                            "command fragment received inside a data set".to_string(),
                        ));
                    }
                }
            }
            message.data = Some(data);
        }

        Ok(Incoming::Message(message))
    }

    fn next_value(&mut self) -> Result<Next> {
        loop {
            if let Some(value) = self.pending.pop_front() {
                return Ok(Next::Value(value));
            }
            match self.wire.receive_pdu()? {
                Pdu::PData { data } => self.pending.extend(data),
                Pdu::ReleaseRQ | Pdu::ReleaseRP => return Ok(Next::Release),
                Pdu::AbortRQ { .. } => return Ok(Next::Abort),
                other => {
                    return Err(DimseError::DicomUl(format!(
                        "unexpected PDU during DIMSE exchange: {:?}",
                        other
                    )));
                }
            }
        }
    }

    fn fragment_size(&self) -> usize {
        if self.max_pdu == 0 {
            return UNLIMITED_PDU_FRAGMENT;
        }
        (self.max_pdu as usize).saturating_sub(PDU_OVERHEAD).max(1)
    }

    fn send_fragments(&mut self, presentation_context_id: u8, command: bool, bytes: &[u8]) -> Result<()> {
        let size = self.fragment_size();
        let total = bytes.len().div_ceil(size).max(1);
        for index in 0..total {
            let start = (index * size).min(bytes.len());
            let end = (start + size).min(bytes.len());
            let value_type = if command {
                PDataValueType::Command
            } else {
                PDataValueType::Data
            };
            let pdu = Pdu::PData {
                data: vec![PDataValue {
                    presentation_context_id,
                    value_type,
                    is_last: index + 1 == total,
                    data: bytes[start..end].to_vec(),
                }],
            };
            self.wire.send_pdu(&pdu)?;
        }
        Ok(())
    }
}

/// Encode a command set in Implicit VR Little Endian
pub fn encode_command(command: &InMemDicomObject) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    command
        .write_dataset_with_ts(&mut bytes, &IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .map_err(|e| DimseError::DicomParsing(format!("failed to encode command: {}", e)))?;
    Ok(bytes)
}

fn decode_command(bytes: &[u8]) -> Result<InMemDicomObject> {
    InMemDicomObject::read_dataset_with_ts(bytes, &IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .map_err(|e| DimseError::DicomParsing(format!("failed to decode command: {}", e)))
}

/// Encode a data set in the given transfer syntax
pub fn encode_dataset(dataset: &InMemDicomObject, transfer_syntax: &str) -> Result<Vec<u8>> {
    let ts = TransferSyntaxRegistry
        .get(transfer_syntax)
        .ok_or_else(|| DimseError::DicomParsing(format!("unknown transfer syntax {}", transfer_syntax)))?;
    let mut bytes = Vec::new();
    dataset
        .write_dataset_with_ts(&mut bytes, ts)
        .map_err(|e| DimseError::DicomParsing(format!("failed to encode data set: {}", e)))?;
    Ok(bytes)
}

/// Decode a data set received on a context with the given transfer syntax
pub fn decode_dataset(bytes: &[u8], transfer_syntax: &str) -> Result<InMemDicomObject> {
    let ts = TransferSyntaxRegistry
        .get(transfer_syntax)
        .ok_or_else(|| DimseError::DicomParsing(format!("unknown transfer syntax {}", transfer_syntax)))?;
    InMemDicomObject::read_dataset_with_ts(bytes, ts)
        .map_err(|e| DimseError::DicomParsing(format!("failed to decode data set: {}", e)))
}

pub fn command_u16(command: &InMemDicomObject, tag: Tag) -> Option<u16> {
    command.element(tag).ok()?.to_int::<u16>().ok()
}

fn command_has_dataset(command: &InMemDicomObject) -> bool {
    command_u16(command, tags::COMMAND_DATA_SET_TYPE)
        .map(|value| value != NO_DATASET)
        .unwrap_or(false)
}

/// UIDs are padded with a trailing NUL to an even length
fn uid_value(uid: &str) -> PrimitiveValue {
    let uid = uid.trim_end_matches('\0');
    if uid.len() % 2 == 1 {
        PrimitiveValue::from(format!("{}\0", uid))
    } else {
        PrimitiveValue::from(uid)
    }
}

fn ae_value(aet: &str) -> PrimitiveValue {
    let aet = aet.trim();
    if aet.len() % 2 == 1 {
        PrimitiveValue::from(format!("{} ", aet))
    } else {
        PrimitiveValue::from(aet)
    }
}

fn us(tag: Tag, value: u16) -> DataElement<InMemDicomObject> {
    DataElement::new(tag, VR::US, PrimitiveValue::from(value))
}

fn dataset_type(present: bool) -> u16 {
    if present {
        DATASET_PRESENT
    } else {
        NO_DATASET
    }
}

pub fn find_request(message_id: u16, sop_class_uid: &str, priority: MovePriority) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, uid_value(sop_class_uid)),
        us(tags::COMMAND_FIELD, DimseCommand::Find.request_field()),
        us(tags::MESSAGE_ID, message_id),
        us(tags::PRIORITY, priority.code()),
        us(tags::COMMAND_DATA_SET_TYPE, DATASET_PRESENT),
    ])
}

pub fn move_request(
    message_id: u16,
    sop_class_uid: &str,
    priority: MovePriority,
    destination_aet: &str,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, uid_value(sop_class_uid)),
        us(tags::COMMAND_FIELD, DimseCommand::Move.request_field()),
        us(tags::MESSAGE_ID, message_id),
        us(tags::PRIORITY, priority.code()),
        us(tags::COMMAND_DATA_SET_TYPE, DATASET_PRESENT),
        DataElement::new(tags::MOVE_DESTINATION, VR::AE, ae_value(destination_aet)),
    ])
}

pub fn store_request(
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    priority: MovePriority,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, uid_value(sop_class_uid)),
        us(tags::COMMAND_FIELD, DimseCommand::Store.request_field()),
        us(tags::MESSAGE_ID, message_id),
        us(tags::PRIORITY, priority.code()),
        us(tags::COMMAND_DATA_SET_TYPE, DATASET_PRESENT),
        DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, uid_value(sop_instance_uid)),
    ])
}

pub fn store_response(
    responded_message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    status: u16,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, uid_value(sop_class_uid)),
        us(tags::COMMAND_FIELD, DimseCommand::Store.response_field()),
        us(tags::MESSAGE_ID_BEING_RESPONDED_TO, responded_message_id),
        us(tags::COMMAND_DATA_SET_TYPE, NO_DATASET),
        us(tags::STATUS, status),
        DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, uid_value(sop_instance_uid)),
    ])
}

/// Response for C-ECHO or for a request this node does not serve
pub fn status_response(
    command_field: u16,
    responded_message_id: u16,
    sop_class_uid: Option<&str>,
    status: u16,
    with_dataset: bool,
) -> InMemDicomObject {
    let mut elements = Vec::with_capacity(5);
    if let Some(uid) = sop_class_uid {
        elements.push(DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, uid_value(uid)));
    }
    elements.push(us(tags::COMMAND_FIELD, command_field));
    elements.push(us(tags::MESSAGE_ID_BEING_RESPONDED_TO, responded_message_id));
    elements.push(us(tags::COMMAND_DATA_SET_TYPE, dataset_type(with_dataset)));
    elements.push(us(tags::STATUS, status));
    InMemDicomObject::command_from_element_iter(elements)
}
