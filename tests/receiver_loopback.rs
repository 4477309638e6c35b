use dcmcat::receiver::{InboundReceiver, UNKNOWN_SESSION};
use dicom_dictionary_std::tags;
use dimse::types::string_value;
use dimse::{AssociationFactory, DimseConfig, DimseScu, PresentationContext, RemoteNode};
use tempfile::TempDir;

mod common;
use common::{Fixture, CT_IMAGE_STORAGE};

fn loopback(aet: &str) -> DimseConfig {
    DimseConfig {
        local_aet: aet.to_string(),
        bind_addr: "127.0.0.1".parse().unwrap(),
        port: 0,
        ..Default::default()
    }
}

#[tokio::test]
async fn pushed_objects_are_filed_by_subject_and_session() {
    let fixtures = TempDir::new().unwrap();
    let chest = fixtures.path().join("chest.dcm");
    Fixture::new("1.2.9", "1.2.9.1", "1.2.9.1.1")
        .patient_name("Doe^John")
        .description("CT Chest")
        .write(&chest);
    let untitled = fixtures.path().join("untitled.dcm");
    Fixture::new("1.2.9", "1.2.9.2", "1.2.9.2.1")
        .patient_name("Doe^John")
        .write(&untitled);

    let output = TempDir::new().unwrap();
    let receiver = InboundReceiver::start(loopback("RECEIVER"), output.path()).await.unwrap();
    assert!(receiver.running());

    let scu = DimseScu::new(loopback("SENDER"));
    let node = RemoteNode::new("RECEIVER", "127.0.0.1", receiver.port());
    let mut association = scu
        .associate(&node, vec![PresentationContext::uncompressed(CT_IMAGE_STORAGE)])
        .await
        .expect("association with local receiver");

    assert!(association.store_file(&chest).await.unwrap().is_success());
    // The same instance again overwrites its file
    assert!(association.store_file(&chest).await.unwrap().is_success());
    assert!(association.store_file(&untitled).await.unwrap().is_success());
    association.release().await.unwrap();

    assert_eq!(receiver.stop().await.unwrap(), 3);

    let session_dir = output.path().join("j_doe").join("CT_Chest");
    let files: Vec<_> = std::fs::read_dir(&session_dir).unwrap().collect();
    assert_eq!(files.len(), 1);

    let stored = dicom_object::open_file(session_dir.join("1.2.9.1.1.dcm")).unwrap();
    assert_eq!(string_value(&stored, tags::PATIENT_ID).as_deref(), Some("P01"));
    assert_eq!(
        string_value(&stored, tags::SERIES_INSTANCE_UID).as_deref(),
        Some("1.2.9.1")
    );

    assert!(output
        .path()
        .join("j_doe")
        .join(UNKNOWN_SESSION)
        .join("1.2.9.2.1.dcm")
        .is_file());
}

#[tokio::test]
async fn stopped_receiver_refuses_connections() {
    let output = TempDir::new().unwrap();
    let receiver = InboundReceiver::start(loopback("RECEIVER"), output.path()).await.unwrap();
    let port = receiver.port();
    assert!(tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok());

    receiver.stop().await.unwrap();
    assert!(tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_err());
}
