use std::path::{Path, PathBuf};

use autoapply_adapters::{parse_greenhouse_jobs, scan_html};
use autoapply_core::AtsKind;

fn fixture(rel: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..").join("fixtures").join(rel)
}

#[test]
fn every_provider_has_listing_fixture() {
    for rel in [
        "greenhouse/jobs.json",
        "lever/postings.json",
        "ashby/board.html",
        "smartrecruiters/careers.html",
    ] {
        assert!(fixture(rel).exists(), "missing fixture {rel}");
    }
}

#[test]
fn greenhouse_fixture_lists_jobs_through_public_api() {
    let body: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(fixture("greenhouse/jobs.json")).unwrap()).unwrap();
    assert_eq!(parse_greenhouse_jobs(&body).unwrap().len(), 2);
}

#[test]
fn careers_page_fixture_yields_lever_handle() {
    let html = std::fs::read_to_string(fixture("discovery/acme-careers.html")).unwrap();
    let hit = scan_html(&html, AtsKind::Lever).unwrap();
    assert_eq!(hit.handle, "acme-labs");
}
