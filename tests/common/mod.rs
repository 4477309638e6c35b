#![allow(dead_code)]

use async_trait::async_trait;
use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::meta::FileMetaTableBuilder;
use dicom_object::InMemDicomObject;
use dimse::types::EXPLICIT_VR_LE;
use dimse::{
    Association, AssociationFactory, DimseConfig, DimseError, DimseScu, DimseStatus, FindOutcome, FindQuery, MoveOutcome, MoveQuery,
    PresentationContext, QueryLevel, RemoteNode,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
pub const MR_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.4";

/// Attributes of a generated test instance
#[derive(Debug, Clone)]
pub struct Fixture {
    pub sop_class: &'static str,
    pub study_uid: String,
    pub series_uid: Option<String>,
    pub sop_uid: String,
    pub patient_name: Option<String>,
    pub patient_id: Option<String>,
    pub series_description: Option<String>,
    pub study_date: Option<String>,
}

impl Fixture {
    pub fn new(study_uid: &str, series_uid: &str, sop_uid: &str) -> Self {
        Self {
            sop_class: CT_IMAGE_STORAGE,
            study_uid: study_uid.to_string(),
            series_uid: Some(series_uid.to_string()),
            sop_uid: sop_uid.to_string(),
            patient_name: None,
            patient_id: Some("P01".to_string()),
            series_description: None,
            study_date: Some("20230115".to_string()),
        }
    }

    pub fn description(mut self, description: &str) -> Self {
        self.series_description = Some(description.to_string());
        self
    }

    pub fn patient_name(mut self, name: &str) -> Self {
        self.patient_name = Some(name.to_string());
        self
    }

    pub fn sop_class(mut self, sop_class: &'static str) -> Self {
        self.sop_class = sop_class;
        self
    }

    pub fn without_series_uid(mut self) -> Self {
        self.series_uid = None;
        self
    }

    /// Write a Part 10 file (Explicit VR Little Endian) at `path`
    pub fn write(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let mut obj = InMemDicomObject::new_empty();
        put(&mut obj, tags::SOP_CLASS_UID, VR::UI, Some(self.sop_class));
        put(&mut obj, tags::SOP_INSTANCE_UID, VR::UI, Some(self.sop_uid.as_str()));
        put(&mut obj, tags::STUDY_INSTANCE_UID, VR::UI, Some(self.study_uid.as_str()));
        put(&mut obj, tags::SERIES_INSTANCE_UID, VR::UI, self.series_uid.as_deref());
        put(&mut obj, tags::PATIENT_NAME, VR::PN, self.patient_name.as_deref());
        put(&mut obj, tags::PATIENT_ID, VR::LO, self.patient_id.as_deref());
        put(&mut obj, tags::SERIES_DESCRIPTION, VR::LO, self.series_description.as_deref());
        put(&mut obj, tags::STUDY_DATE, VR::DA, self.study_date.as_deref());
        obj.with_meta(
            FileMetaTableBuilder::new()
                .media_storage_sop_class_uid(self.sop_class)
                .media_storage_sop_instance_uid(self.sop_uid.as_str())
                .transfer_syntax(EXPLICIT_VR_LE),
        )
        .unwrap()
        .write_to_file(path)
        .unwrap();
    }
}

fn put(obj: &mut InMemDicomObject, tag: Tag, vr: VR, value: Option<&str>) {
    if let Some(value) = value {
        obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
    }
}

/// Identifier returned by the fake node for a series-level match
pub fn series_match(study_uid: &str, series_uid: Option<&str>, description: &str) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    put(&mut obj, tags::STUDY_INSTANCE_UID, VR::UI, Some(study_uid));
    put(&mut obj, tags::SERIES_INSTANCE_UID, VR::UI, series_uid);
    put(&mut obj, tags::SERIES_DESCRIPTION, VR::LO, Some(description));
    put(&mut obj, tags::PATIENT_ID, VR::LO, Some("P01"));
    put(&mut obj, tags::STUDY_DATE, VR::DA, Some("20230115"));
    obj
}

/// In-process stand-in for a remote PACS
#[derive(Default)]
pub struct FakePacs {
    /// Accession number to study UIDs
    pub studies: HashMap<String, Vec<String>>,
    /// Study UID to series-level identifiers
    pub series: HashMap<String, Vec<InMemDicomObject>>,
    /// Refuse every association
    pub refuse: bool,
    /// Port that must be accepting connections whenever a C-MOVE arrives
    pub receiver_port: Option<u16>,
    /// When set, every C-MOVE C-STOREs one generated instance of the series to
    /// `receiver_port`; the files are written here first
    pub push_from: Option<PathBuf>,
    pub move_delay: Duration,

    pub associations: AtomicUsize,
    pub proposed: Mutex<Vec<Vec<PresentationContext>>>,
    pub finds: Mutex<Vec<FindQuery>>,
    pub moves: Mutex<Vec<MoveQuery>>,
    pub receiver_seen: Mutex<Vec<bool>>,
    pub stored: Mutex<Vec<PathBuf>>,
    pub active_moves: AtomicUsize,
    pub max_concurrent_moves: AtomicUsize,
}

impl FakePacs {
    pub fn node() -> RemoteNode {
        RemoteNode::new("PACS", "pacs.test", 104)
    }

    pub fn with_study(mut self, accession: &str, study_uid: &str, series: Vec<InMemDicomObject>) -> Self {
        self.studies
            .entry(accession.to_string())
            .or_default()
            .push(study_uid.to_string());
        self.series.insert(study_uid.to_string(), series);
        self
    }
}

pub struct FakeFactory(pub Arc<FakePacs>);

#[async_trait]
impl AssociationFactory for FakeFactory {
    async fn associate(
        &self,
        _node: &RemoteNode,
        contexts: Vec<PresentationContext>,
    ) -> dimse::Result<Box<dyn Association>> {
        if self.0.refuse {
            return Err(DimseError::AssociationRejected("refused by test node".to_string()));
        }
        self.0.associations.fetch_add(1, Ordering::SeqCst);
        self.0.proposed.lock().unwrap().push(contexts);
        Ok(Box::new(FakeAssociation(Arc::clone(&self.0))))
    }
}

struct FakeAssociation(Arc<FakePacs>);

fn key(query: &FindQuery, tag: Tag) -> Option<String> {
    query.keys.iter().find(|k| k.tag == tag).map(|k| k.value.clone())
}

#[async_trait]
impl Association for FakeAssociation {
    async fn find(&mut self, query: &FindQuery) -> dimse::Result<FindOutcome> {
        self.0.finds.lock().unwrap().push(query.clone());
        let matches: Vec<InMemDicomObject> = match query.query_level {
            QueryLevel::Study => key(query, tags::ACCESSION_NUMBER)
                .and_then(|accession| self.0.studies.get(&accession))
                .map(|studies| {
                    studies
                        .iter()
                        .map(|uid| {
                            let mut obj = InMemDicomObject::new_empty();
                            put(&mut obj, tags::STUDY_INSTANCE_UID, VR::UI, Some(uid.as_str()));
                            obj
                        })
                        .collect()
                })
                .unwrap_or_default(),
            QueryLevel::Series => key(query, tags::STUDY_INSTANCE_UID)
                .and_then(|study| self.0.series.get(&study).cloned())
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        Ok(FindOutcome {
            status: DimseStatus::Success,
            matches,
        })
    }

    async fn move_request(&mut self, query: &MoveQuery) -> dimse::Result<MoveOutcome> {
        let active = self.0.active_moves.fetch_add(1, Ordering::SeqCst) + 1;
        self.0.max_concurrent_moves.fetch_max(active, Ordering::SeqCst);

        if let Some(port) = self.0.receiver_port {
            let listening = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok();
            self.0.receiver_seen.lock().unwrap().push(listening);
        }
        tokio::time::sleep(self.0.move_delay).await;
        if let (Some(port), Some(dir)) = (self.0.receiver_port, self.0.push_from.as_deref()) {
            push_series(query, port, dir).await;
        }
        self.0.moves.lock().unwrap().push(query.clone());

        self.0.active_moves.fetch_sub(1, Ordering::SeqCst);
        Ok(MoveOutcome {
            status: DimseStatus::Success,
            completed: 1,
            failed: 0,
            warning: 0,
        })
    }

    async fn store_file(&mut self, path: &Path) -> dimse::Result<DimseStatus> {
        self.0.stored.lock().unwrap().push(path.to_path_buf());
        let rejected = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with("reject"));
        Ok(if rejected {
            DimseStatus::Failure(0xA700)
        } else {
            DimseStatus::Success
        })
    }

    async fn release(self: Box<Self>) -> dimse::Result<()> {
        Ok(())
    }
}

/// Instance pushed for a moved series: `<series>.1`, patient `Doe^Jane`, series `AX T1`
async fn push_series(query: &MoveQuery, port: u16, dir: &Path) {
    let value = |tag: Tag| {
        query
            .keys
            .iter()
            .find(|k| k.tag == tag)
            .map(|k| k.value.clone())
            .unwrap()
    };
    let study_uid = value(tags::STUDY_INSTANCE_UID);
    let series_uid = value(tags::SERIES_INSTANCE_UID);
    let path = dir.join(format!("{}.dcm", series_uid));
    Fixture::new(&study_uid, &series_uid, &format!("{}.1", series_uid))
        .patient_name("Doe^Jane")
        .description("AX T1")
        .write(&path);

    let scu = DimseScu::new(DimseConfig {
        local_aet: "PACS".to_string(),
        ..Default::default()
    });
    let destination = RemoteNode::new(query.destination_aet.as_str(), "127.0.0.1", port);
    let mut association = scu
        .associate(&destination, vec![PresentationContext::uncompressed(CT_IMAGE_STORAGE)])
        .await
        .expect("association with the move destination");
    let status = association.store_file(&path).await.unwrap();
    association.release().await.unwrap();
    assert!(status.is_success(), "push of {} ended with {}", series_uid, status);
}
