use dcmcat::catalog::{CatalogStore, Origin, SeriesMetadata};
use dcmcat::query::{search, write_csv, QueryFilter};
use std::path::PathBuf;
use tempfile::TempDir;

fn series(uid: &str, description: &str, date: &str) -> SeriesMetadata {
    let mut s = SeriesMetadata::new(uid, Origin::Archive(PathBuf::from("/archive")));
    s.study_instance_uid = Some(format!("{}.0", uid));
    s.series_description = Some(description.to_string());
    s.study_description = Some("RESEARCH".to_string());
    s.patient_id = Some("P01".to_string());
    s.study_date = Some(date.to_string());
    s
}

async fn catalog(dir: &TempDir) -> CatalogStore {
    let catalog = CatalogStore::open(&dir.path().join("catalog.redb")).unwrap();
    for s in [
        series("1.1", "CHEST PA", "20230101"),
        series("1.2", "Abdomen", "20230115"),
        series("1.3", "chest lateral", "20230201"),
    ] {
        catalog.upsert_series(s).await.unwrap();
    }
    catalog
}

#[tokio::test]
async fn date_range_selects_inclusive_window() {
    let dir = TempDir::new().unwrap();
    let catalog = catalog(&dir).await;

    let filter =
        QueryFilter::from_options(None, Some("20230110".into()), Some("20230131".into()), None, None).unwrap();
    let rows = search(&catalog, &filter).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].study_date, "20230115");
    assert_eq!(rows[0].series_instance_uid, "1.2");

    let exact = QueryFilter::from_options(Some("20230201".into()), None, None, None, None).unwrap();
    assert_eq!(search(&catalog, &exact).unwrap()[0].series_instance_uid, "1.3");
}

#[tokio::test]
async fn pattern_matches_any_target_column() {
    let dir = TempDir::new().unwrap();
    let catalog = catalog(&dir).await;

    let filter =
        QueryFilter::from_options(None, None, None, Some("SeriesDescription"), Some("(?i)chest")).unwrap();
    let uids: Vec<String> = search(&catalog, &filter)
        .unwrap()
        .into_iter()
        .map(|r| r.series_instance_uid)
        .collect();
    assert_eq!(uids, vec!["1.1", "1.3"]);

    // Pattern and dates combine with AND
    let filter = QueryFilter::from_options(
        None,
        Some("20230110".into()),
        None,
        Some("StudyDescription,SeriesDescription"),
        Some("(?i)chest"),
    )
    .unwrap();
    let rows = search(&catalog, &filter).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].series_instance_uid, "1.3");
}

#[tokio::test]
async fn results_are_written_as_csv() {
    let dir = TempDir::new().unwrap();
    let catalog = catalog(&dir).await;

    let rows = search(&catalog, &QueryFilter::default()).unwrap();
    let mut out = Vec::new();
    write_csv(&rows, &mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(
        lines[0],
        "StudyDescription,SeriesDescription,PatientName,PatientID,StudyDate,SeriesInstanceUID"
    );
    assert!(lines.contains(&"RESEARCH,Abdomen,,P01,20230115,1.2"));
}

#[tokio::test]
async fn missing_catalog_is_reported() {
    let dir = TempDir::new().unwrap();
    let result = CatalogStore::open_existing(&dir.path().join("absent.redb"));
    assert!(matches!(result, Err(dcmcat::Error::CatalogNotFound(_))));
}
