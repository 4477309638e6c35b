//! Common types for DIMSE operations

use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_object::InMemDicomObject;
use serde::{Deserialize, Serialize};

/// Study Root Query/Retrieve Information Model - FIND
pub const STUDY_ROOT_FIND: &str = uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND;

/// Study Root Query/Retrieve Information Model - MOVE
pub const STUDY_ROOT_MOVE: &str = uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE;

/// Verification SOP Class
pub const VERIFICATION: &str = uids::VERIFICATION;

/// Implicit VR Little Endian, the transfer syntax every node must support
pub const IMPLICIT_VR_LE: &str = uids::IMPLICIT_VR_LITTLE_ENDIAN;

/// Explicit VR Little Endian
pub const EXPLICIT_VR_LE: &str = uids::EXPLICIT_VR_LITTLE_ENDIAN;

/// DIMSE command types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DimseCommand {
    /// C-ECHO command
    Echo,
    /// C-FIND command
    Find,
    /// C-MOVE command
    Move,
    /// C-STORE command
    Store,
}

impl DimseCommand {
    /// Command Field value of the request message
    pub fn request_field(self) -> u16 {
        match self {
            DimseCommand::Store => 0x0001,
            DimseCommand::Find => 0x0020,
            DimseCommand::Move => 0x0021,
            DimseCommand::Echo => 0x0030,
        }
    }

    /// Command Field value of the response message
    pub fn response_field(self) -> u16 {
        self.request_field() | 0x8000
    }

    /// Resolve a request Command Field
    pub fn from_request_field(field: u16) -> Option<Self> {
        match field {
            0x0001 => Some(DimseCommand::Store),
            0x0020 => Some(DimseCommand::Find),
            0x0021 => Some(DimseCommand::Move),
            0x0030 => Some(DimseCommand::Echo),
            _ => None,
        }
    }
}

/// DICOM query/retrieve levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryLevel {
    /// Patient level
    Patient,
    /// Study level
    Study,
    /// Series level
    Series,
    /// Image level
    Image,
}

/// Priority levels for DIMSE requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MovePriority {
    /// Low priority
    Low,
    /// Medium priority (default)
    Medium,
    /// High priority
    High,
}

impl MovePriority {
    /// Priority value as carried in the command set
    pub fn code(self) -> u16 {
        match self {
            MovePriority::Low => 0x0002,
            MovePriority::Medium => 0x0000,
            MovePriority::High => 0x0001,
        }
    }
}

/// DIMSE operation status, reduced to the three classes the catalog acts on.
///
/// Anything that is neither success (0x0000) nor pending (0xFF00 / 0xFF01)
/// counts as a failure, warnings included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimseStatus {
    /// Operation completed successfully
    Success,
    /// More responses follow
    Pending(u16),
    /// Any other status code
    Failure(u16),
}

impl DimseStatus {
    /// Status for a raw DICOM status code
    pub fn from_code(code: u16) -> Self {
        match code {
            0x0000 => DimseStatus::Success,
            0xFF00 | 0xFF01 => DimseStatus::Pending(code),
            other => DimseStatus::Failure(other),
        }
    }

    /// The raw status code
    pub fn code(&self) -> u16 {
        match self {
            DimseStatus::Success => 0x0000,
            DimseStatus::Pending(code) | DimseStatus::Failure(code) => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DimseStatus::Success)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, DimseStatus::Pending(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, DimseStatus::Failure(_))
    }
}

impl std::fmt::Display for DimseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DimseStatus::Success => write!(f, "success (0x0000)"),
            DimseStatus::Pending(code) => write!(f, "pending (0x{:04X})", code),
            DimseStatus::Failure(code) => write!(f, "failure (0x{:04X})", code),
        }
    }
}

/// A presentation context to propose when opening an association
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContext {
    /// Abstract syntax (SOP Class UID)
    pub abstract_syntax: String,
    /// Proposed transfer syntaxes, in order of preference
    pub transfer_syntaxes: Vec<String>,
}

impl PresentationContext {
    /// Context offering the two uncompressed little endian transfer syntaxes
    pub fn uncompressed(abstract_syntax: impl Into<String>) -> Self {
        Self {
            abstract_syntax: abstract_syntax.into(),
            transfer_syntaxes: vec![EXPLICIT_VR_LE.to_string(), IMPLICIT_VR_LE.to_string()],
        }
    }

    /// Context offering the given transfer syntaxes followed by the uncompressed defaults
    pub fn with_preferred<I, S>(abstract_syntax: impl Into<String>, preferred: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut context = Self {
            abstract_syntax: abstract_syntax.into(),
            transfer_syntaxes: Vec::new(),
        };
        for ts in preferred
            .into_iter()
            .map(Into::into)
            .chain([EXPLICIT_VR_LE.to_string(), IMPLICIT_VR_LE.to_string()])
        {
            if !context.transfer_syntaxes.contains(&ts) {
                context.transfer_syntaxes.push(ts);
            }
        }
        context
    }
}

/// A single key of a query identifier
#[derive(Debug, Clone, PartialEq)]
pub struct QueryKey {
    pub tag: Tag,
    pub vr: VR,
    /// Matching value; empty means "return this attribute"
    pub value: String,
}

/// Query parameters for C-FIND operations
#[derive(Debug, Clone, PartialEq)]
pub struct FindQuery {
    /// Query level (PATIENT, STUDY, SERIES, IMAGE)
    pub query_level: QueryLevel,

    /// Matching and return keys
    pub keys: Vec<QueryKey>,

    /// Priority of the request
    pub priority: MovePriority,
}

/// Query parameters for C-MOVE operations
#[derive(Debug, Clone, PartialEq)]
pub struct MoveQuery {
    /// Query level (PATIENT, STUDY, SERIES, IMAGE)
    pub query_level: QueryLevel,

    /// Unique keys selecting the objects to move
    pub keys: Vec<QueryKey>,

    /// Destination AE Title for the move operation
    pub destination_aet: String,

    /// Priority of the move operation
    pub priority: MovePriority,
}

/// Result of a C-FIND exchange: the matches and the final status
#[derive(Debug, Clone)]
pub struct FindOutcome {
    /// Final (non-pending) status reported by the remote node
    pub status: DimseStatus,
    /// Identifiers received with pending responses
    pub matches: Vec<InMemDicomObject>,
}

/// Result of a C-MOVE exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveOutcome {
    /// Final (non-pending) status reported by the remote node
    pub status: DimseStatus,
    pub completed: u16,
    pub failed: u16,
    pub warning: u16,
}

impl FindQuery {
    /// Create an empty query at the given level
    pub fn new(query_level: QueryLevel) -> Self {
        Self {
            query_level,
            keys: Vec::new(),
            priority: MovePriority::Medium,
        }
    }

    /// Add a matching key
    pub fn with_key(mut self, tag: Tag, vr: VR, value: impl Into<String>) -> Self {
        self.keys.push(QueryKey {
            tag,
            vr,
            value: value.into(),
        });
        self
    }

    /// Add a return key (universal matching)
    pub fn returning(self, tag: Tag, vr: VR) -> Self {
        self.with_key(tag, vr, "")
    }

    /// Build the identifier data set sent with the request
    pub fn identifier(&self) -> InMemDicomObject {
        build_identifier(self.query_level, &self.keys)
    }
}

impl MoveQuery {
    /// Create a new move query
    pub fn new(query_level: QueryLevel, destination_aet: impl Into<String>) -> Self {
        Self {
            query_level,
            keys: Vec::new(),
            destination_aet: destination_aet.into(),
            priority: MovePriority::Medium,
        }
    }

    /// Series-level move keyed by study and series instance UIDs
    pub fn series(
        study_instance_uid: impl Into<String>,
        series_instance_uid: impl Into<String>,
        destination_aet: impl Into<String>,
    ) -> Self {
        Self::new(QueryLevel::Series, destination_aet)
            .with_key(tags::STUDY_INSTANCE_UID, VR::UI, study_instance_uid)
            .with_key(tags::SERIES_INSTANCE_UID, VR::UI, series_instance_uid)
    }

    /// Add a unique key
    pub fn with_key(mut self, tag: Tag, vr: VR, value: impl Into<String>) -> Self {
        self.keys.push(QueryKey {
            tag,
            vr,
            value: value.into(),
        });
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: MovePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Build the identifier data set sent with the request
    pub fn identifier(&self) -> InMemDicomObject {
        build_identifier(self.query_level, &self.keys)
    }
}

fn build_identifier(level: QueryLevel, keys: &[QueryKey]) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::QUERY_RETRIEVE_LEVEL,
        VR::CS,
        PrimitiveValue::from(level.to_string()),
    ));
    for key in keys {
        let value = if key.value.is_empty() {
            PrimitiveValue::Empty
        } else {
            PrimitiveValue::from(key.value.as_str())
        };
        obj.put(DataElement::new(key.tag, key.vr, value));
    }
    obj
}

/// Read a string attribute, trimming DICOM padding; empty values read as `None`
pub fn string_value(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches('\0').trim().to_string())
        .filter(|s| !s.is_empty())
}

impl std::fmt::Display for QueryLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryLevel::Patient => write!(f, "PATIENT"),
            QueryLevel::Study => write!(f, "STUDY"),
            QueryLevel::Series => write!(f, "SERIES"),
            QueryLevel::Image => write!(f, "IMAGE"),
        }
    }
}

impl std::str::FromStr for QueryLevel {
    type Err = crate::error::DimseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PATIENT" => Ok(QueryLevel::Patient),
            "STUDY" => Ok(QueryLevel::Study),
            "SERIES" => Ok(QueryLevel::Series),
            "IMAGE" => Ok(QueryLevel::Image),
            _ => Err(crate::error::DimseError::config(format!(
                "Invalid query level: {}",
                s
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classes() {
        assert_eq!(DimseStatus::from_code(0x0000), DimseStatus::Success);
        assert!(DimseStatus::from_code(0xFF00).is_pending());
        assert!(DimseStatus::from_code(0xFF01).is_pending());
        assert!(DimseStatus::from_code(0xA700).is_failure());
        // warnings are not success
        assert!(DimseStatus::from_code(0xB000).is_failure());
        assert_eq!(DimseStatus::from_code(0xC001).code(), 0xC001);
    }

    #[test]
    fn test_find_query_builder() {
        let query = FindQuery::new(QueryLevel::Study)
            .with_key(tags::ACCESSION_NUMBER, VR::SH, "ACC001")
            .returning(tags::STUDY_INSTANCE_UID, VR::UI);

        assert_eq!(query.keys.len(), 2);
        let identifier = query.identifier();
        assert_eq!(
            string_value(&identifier, tags::QUERY_RETRIEVE_LEVEL).as_deref(),
            Some("STUDY")
        );
        assert_eq!(
            string_value(&identifier, tags::ACCESSION_NUMBER).as_deref(),
            Some("ACC001")
        );
        // return keys are present but empty
        assert!(identifier.element(tags::STUDY_INSTANCE_UID).is_ok());
        assert_eq!(string_value(&identifier, tags::STUDY_INSTANCE_UID), None);
    }

    #[test]
    fn test_move_query_series() {
        let query = MoveQuery::series("1.2.3", "1.2.3.4", "DCMCAT");
        assert_eq!(query.query_level, QueryLevel::Series);
        assert_eq!(query.destination_aet, "DCMCAT");
        let identifier = query.identifier();
        assert_eq!(
            string_value(&identifier, tags::SERIES_INSTANCE_UID).as_deref(),
            Some("1.2.3.4")
        );
    }

    #[test]
    fn test_presentation_context_dedup() {
        let pc = PresentationContext::with_preferred("1.2.840.10008.5.1.4.1.1.2", [EXPLICIT_VR_LE]);
        assert_eq!(
            pc.transfer_syntaxes,
            vec![EXPLICIT_VR_LE.to_string(), IMPLICIT_VR_LE.to_string()]
        );
    }

    #[test]
    fn test_command_fields() {
        assert_eq!(DimseCommand::Find.response_field(), 0x8020);
        assert_eq!(DimseCommand::from_request_field(0x0001), Some(DimseCommand::Store));
        assert_eq!(DimseCommand::from_request_field(0x0FFF), None);
    }

    #[test]
    fn test_query_level_parsing() {
        assert_eq!("PATIENT".parse::<QueryLevel>().unwrap(), QueryLevel::Patient);
        assert_eq!("series".parse::<QueryLevel>().unwrap(), QueryLevel::Series);
        assert!("INVALID".parse::<QueryLevel>().is_err());
    }
}
