use dcmcat::catalog::{CatalogStore, Origin};
use dcmcat::indexer::{index_by_accession_list, ResumePoint};
use dcmcat::Project;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tempfile::TempDir;

mod common;
use common::{series_match, FakeFactory, FakePacs};

fn pacs() -> FakePacs {
    FakePacs::default()
        .with_study(
            "ACC1",
            "1.1",
            vec![
                series_match("1.1", Some("1.1.1"), "AX T1"),
                series_match("1.1", Some("1.1.2"), "AX T2"),
            ],
        )
        .with_study(
            "ACC3",
            "3.1",
            vec![
                series_match("3.1", Some("3.1.1"), "LOCALIZER"),
                series_match("3.1", None, "NO UID"),
            ],
        )
        .with_study("ACC4", "4.1", vec![series_match("4.1", Some("4.1.1"), "DWI")])
}

fn project(home: &TempDir) -> Project {
    let targets = home.path().join("targets.txt");
    std::fs::write(&targets, "ACC1\n\nACC2\nACC3\nACC4\n").unwrap();
    Project::create(home.path(), "neuro", FakePacs::node(), &targets).unwrap()
}

fn series_uids(catalog: &CatalogStore) -> Vec<String> {
    catalog
        .series()
        .unwrap()
        .into_iter()
        .map(|s| s.series_instance_uid)
        .collect()
}

#[tokio::test]
async fn cascade_indexes_every_series_found() {
    let home = TempDir::new().unwrap();
    let project = project(&home);
    let catalog = project.open_catalog().unwrap();
    let fake = Arc::new(pacs());

    let report = index_by_accession_list(&project, &catalog, &FakeFactory(Arc::clone(&fake)), ResumePoint::Start)
        .await
        .unwrap();

    assert_eq!(report.accessions, 4);
    assert_eq!(report.studies_found, 3);
    assert_eq!(report.series_indexed, 4);
    assert_eq!(report.series_skipped, 1);
    assert_eq!(report.failures, 1, "ACC2 has no study");
    assert_eq!(series_uids(&catalog), vec!["1.1.1", "1.1.2", "3.1.1", "4.1.1"]);

    // One association serves the whole list
    assert_eq!(fake.associations.load(Ordering::SeqCst), 1);
    assert_eq!(fake.finds.lock().unwrap().len(), 4 + 3);

    let row = catalog.series_by_uid("1.1.2").unwrap().unwrap();
    assert_eq!(row.study_instance_uid.as_deref(), Some("1.1"));
    assert_eq!(row.series_description.as_deref(), Some("AX T2"));
    assert_eq!(row.origin, Origin::Remote("dimse://PACS@pacs.test:104".to_string()));
}

#[tokio::test]
async fn resume_matches_tail_of_full_run() {
    let home = TempDir::new().unwrap();
    let project = project(&home);

    let full_dir = TempDir::new().unwrap();
    let full = CatalogStore::open(&full_dir.path().join("full.redb")).unwrap();
    index_by_accession_list(&project, &full, &FakeFactory(Arc::new(pacs())), ResumePoint::Start)
        .await
        .unwrap();
    // Results of the accessions from line 3 (ACC3) onward
    let expected: Vec<String> = full
        .series()
        .unwrap()
        .into_iter()
        .filter(|s| matches!(s.study_instance_uid.as_deref(), Some("3.1") | Some("4.1")))
        .map(|s| s.series_instance_uid)
        .collect();

    for resume in [ResumePoint::Line(3), ResumePoint::Accession("ACC3".to_string())] {
        let dir = TempDir::new().unwrap();
        let resumed = CatalogStore::open(&dir.path().join("resumed.redb")).unwrap();
        let report = index_by_accession_list(&project, &resumed, &FakeFactory(Arc::new(pacs())), resume)
            .await
            .unwrap();
        assert_eq!(report.accessions, 2);
        assert_eq!(series_uids(&resumed), expected);
        resumed.close();
    }
}

#[tokio::test]
async fn out_of_range_resume_indexes_full_list() {
    let home = TempDir::new().unwrap();
    let project = project(&home);
    let catalog = project.open_catalog().unwrap();

    let report = index_by_accession_list(&project, &catalog, &FakeFactory(Arc::new(pacs())), ResumePoint::Line(99))
        .await
        .unwrap();
    assert_eq!(report.accessions, 4);
}

#[tokio::test]
async fn refused_association_aborts_run() {
    let home = TempDir::new().unwrap();
    let project = project(&home);
    let catalog = project.open_catalog().unwrap();
    let fake = Arc::new(FakePacs {
        refuse: true,
        ..pacs()
    });

    let result = index_by_accession_list(&project, &catalog, &FakeFactory(fake), ResumePoint::Start).await;
    assert!(matches!(result, Err(dcmcat::Error::Dimse(_))));
    assert_eq!(catalog.counts().unwrap().series, 0);
}

#[tokio::test]
async fn missing_target_list_fails_before_connecting() {
    let home = TempDir::new().unwrap();
    let project = project(&home);
    std::fs::remove_file(&project.target_list).unwrap();
    let catalog = project.open_catalog().unwrap();
    let fake = Arc::new(pacs());

    let result = index_by_accession_list(&project, &catalog, &FakeFactory(Arc::clone(&fake)), ResumePoint::Start).await;
    assert!(matches!(result, Err(dcmcat::Error::Project(_))));
    assert_eq!(fake.associations.load(Ordering::SeqCst), 0);
}
