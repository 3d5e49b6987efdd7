use std::time::Duration;

use bytel_harvester::HarvestError;
use bytel_harvester::portal::harvest::BILL_KINDS;
use bytel_harvester::portal::pagination::{PaginationDriver, PaginationLimits};
use bytel_harvester::portal::{PayloadKind, SiteProfile, SyncMode};

use crate::fake_portal::{FakePortal, buffer, cumulative_pages, script_bills};

fn limits(max_pages: usize) -> PaginationLimits {
    PaginationLimits {
        per_page_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(10),
        max_pages,
    }
}

#[tokio::test(start_paused = true)]
async fn incremental_runs_exactly_one_cycle() {
    let profile = SiteProfile::bouygues();
    let buffer = buffer(&profile);
    let portal = FakePortal::new(buffer.clone());
    script_bills(&portal, &profile, cumulative_pages(4), 2);

    let selectors = &profile.selectors;
    let report = PaginationDriver::new(
        &portal,
        &buffer,
        BILL_KINDS,
        &selectors.load_more,
        &selectors.bill_rows,
        limits(10),
    )
    .run(&profile.urls.bills, SyncMode::Incremental)
    .await
    .unwrap();

    assert_eq!(report.pages, 1);
    assert_eq!(report.payloads, 1);
    assert!(!report.exhausted);
    assert_eq!(portal.clicks(&selectors.load_more), 0);
}

#[tokio::test(start_paused = true)]
async fn full_sync_pages_until_load_more_disappears() {
    let profile = SiteProfile::bouygues();
    let buffer = buffer(&profile);
    let portal = FakePortal::new(buffer.clone());
    script_bills(&portal, &profile, cumulative_pages(3), 2);

    let selectors = &profile.selectors;
    let report = PaginationDriver::new(
        &portal,
        &buffer,
        BILL_KINDS,
        &selectors.load_more,
        &selectors.bill_rows,
        limits(10),
    )
    .run(&profile.urls.bills, SyncMode::Full)
    .await
    .unwrap();

    assert_eq!(report.pages, 3);
    assert_eq!(report.payloads, 3);
    assert!(report.exhausted);
    assert_eq!(portal.clicks(&selectors.load_more), 2);

    let latest = buffer.latest(PayloadKind::BillingData).unwrap();
    assert_eq!(latest.index, 2);
    let invoices = latest.body["comptesFacturation"][0]["factures"].as_array().unwrap();
    assert_eq!(invoices.len(), 6);
}

#[tokio::test(start_paused = true)]
async fn missing_payload_stalls_with_page_number() {
    let profile = SiteProfile::bouygues();
    let buffer = buffer(&profile);
    let portal = FakePortal::new(buffer.clone());
    script_bills(&portal, &profile, cumulative_pages(3), 2);

    // Rows grow on the second page but the data response never arrives.
    let rows = profile.selectors.bill_rows.clone();
    portal.on_click(&profile.selectors.load_more, move |s| s.add_count(&rows, 2));

    let selectors = &profile.selectors;
    let err = PaginationDriver::new(
        &portal,
        &buffer,
        BILL_KINDS,
        &selectors.load_more,
        &selectors.bill_rows,
        limits(10),
    )
    .run(&profile.urls.bills, SyncMode::Full)
    .await
    .unwrap_err();

    match err {
        HarvestError::PaginationStalled {
            page, waited_secs, ..
        } => {
            assert_eq!(page, 2);
            assert_eq!(waited_secs, 5);
        }
        other => panic!("expected stall, got {other:?}"),
    }
    assert_eq!(buffer.count(BILL_KINDS), 1);
}

#[tokio::test(start_paused = true)]
async fn page_cap_is_reported_as_stall() {
    let profile = SiteProfile::bouygues();
    let buffer = buffer(&profile);
    let portal = FakePortal::new(buffer.clone());
    script_bills(&portal, &profile, cumulative_pages(5), 1);

    let selectors = &profile.selectors;
    let err = PaginationDriver::new(
        &portal,
        &buffer,
        BILL_KINDS,
        &selectors.load_more,
        &selectors.bill_rows,
        limits(2),
    )
    .run(&profile.urls.bills, SyncMode::Full)
    .await
    .unwrap_err();

    assert!(matches!(err, HarvestError::PaginationStalled { page: 3, .. }), "{err:?}");
}
