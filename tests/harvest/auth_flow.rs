use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use bytel_harvester::HarvestError;
use bytel_harvester::portal::wait::HumanGate;
use bytel_harvester::portal::{AuthState, AuthStateMachine, Credentials, SiteProfile};

use crate::fake_portal::{FakePortal, buffer, fast_wait, script_login, script_logout};

fn machine<'a>(portal: &'a FakePortal, profile: &'a SiteProfile) -> AuthStateMachine<'a> {
    AuthStateMachine::new(portal, profile, fast_wait(), HumanGate::new(Duration::from_secs(1)))
}

#[tokio::test]
async fn future_token_expiry_means_authenticated() {
    let profile = SiteProfile::bouygues();
    let portal = FakePortal::new(buffer(&profile));
    let expiry = (Utc::now() + chrono::Duration::minutes(10)).timestamp_millis();
    portal.with_state(|s| s.set_storage(&profile.storage.token_expiry, &expiry.to_string()));

    let mut auth = machine(&portal, &profile);
    assert!(auth.check_authenticated().await.unwrap());
    assert_eq!(auth.state(), AuthState::Authenticated);
    assert!(auth.session().token_expiry.is_some());
}

#[tokio::test]
async fn past_token_expiry_wins_over_dom_markers() {
    let profile = SiteProfile::bouygues();
    let portal = FakePortal::new(buffer(&profile));
    let expiry = (Utc::now() - chrono::Duration::minutes(10)).timestamp_millis();
    portal.with_state(|s| {
        s.set_storage(&profile.storage.token_expiry, &expiry.to_string());
        s.show(&profile.selectors.disconnect);
    });

    let mut auth = machine(&portal, &profile);
    assert!(!auth.check_authenticated().await.unwrap());
}

#[tokio::test]
async fn stored_credentials_log_in() {
    let profile = SiteProfile::bouygues();
    let portal = FakePortal::new(buffer(&profile));
    script_login(&portal, &profile, "s3cret");

    let credentials = Credentials::new("0612345678", "s3cret");
    let outcome = machine(&portal, &profile)
        .ensure_authenticated(true, Some(&credentials))
        .await
        .unwrap();

    assert!(!outcome.reused_session);
    assert!(outcome.captured.is_none());
    assert_eq!(portal.clicks(&profile.selectors.submit), 1);
    assert_eq!(
        portal.with_state(|s| s.filled(&profile.selectors.username).map(ToOwned::to_owned)),
        Some("0612345678".to_string())
    );
}

#[tokio::test]
async fn live_session_is_reused() {
    let profile = SiteProfile::bouygues();
    let portal = FakePortal::new(buffer(&profile));
    portal.with_state(|s| s.log_in(&profile));

    let outcome = machine(&portal, &profile)
        .ensure_authenticated(true, None)
        .await
        .unwrap();

    assert!(outcome.reused_session);
    assert_eq!(portal.visits(&profile.urls.login), 0);
}

#[tokio::test]
async fn unknown_account_logs_out_lingering_session_first() {
    let profile = SiteProfile::bouygues();
    let portal = FakePortal::new(buffer(&profile));
    portal.with_state(|s| s.log_in(&profile));
    script_logout(&portal, &profile);
    script_login(&portal, &profile, "s3cret");

    let credentials = Credentials::new("0612345678", "s3cret");
    let outcome = machine(&portal, &profile)
        .ensure_authenticated(false, Some(&credentials))
        .await
        .unwrap();

    assert!(!outcome.reused_session);
    assert_eq!(portal.clicks(&profile.selectors.disconnect), 1);
    assert_eq!(portal.clicks(&profile.selectors.submit), 1);
}

#[tokio::test(start_paused = true)]
async fn rejected_credentials_fail_authentication() {
    let profile = SiteProfile::bouygues();
    let portal = FakePortal::new(buffer(&profile));
    script_login(&portal, &profile, "s3cret");

    let credentials = Credentials::new("0612345678", "wrong");
    let mut auth = machine(&portal, &profile);
    let err = auth
        .ensure_authenticated(true, Some(&credentials))
        .await
        .unwrap_err();

    assert!(matches!(err, HarvestError::AuthenticationFailed(_)), "{err:?}");
    assert_eq!(err.code(), "LOGIN_FAILED");
    assert_eq!(auth.state(), AuthState::Failed);
}

#[tokio::test(start_paused = true)]
async fn missing_disconnect_control_means_vendor_unavailable() {
    let profile = SiteProfile::bouygues();
    let portal = FakePortal::new(buffer(&profile));
    script_login(&portal, &profile, "s3cret");
    // Session lands but the page never renders its disconnect link.
    let submit = profile.selectors.submit.clone();
    let p = profile.clone();
    portal.on_click(&submit, move |s| {
        s.log_in(&p);
        s.hide(&p.selectors.disconnect);
    });

    let credentials = Credentials::new("0612345678", "s3cret");
    let err = machine(&portal, &profile)
        .ensure_authenticated(true, Some(&credentials))
        .await
        .unwrap_err();

    assert!(
        matches!(err, HarvestError::VendorUnavailable { stage: "confirm_session", .. }),
        "{err:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn one_time_code_blocks_until_user_confirms() {
    let profile = SiteProfile::bouygues();
    let portal = Arc::new(FakePortal::new(buffer(&profile)));
    script_login(&portal, &profile, "s3cret");

    let submit = profile.selectors.submit.clone();
    let otp_input = profile.selectors.otp_input.clone();
    let otp_button = profile.selectors.otp_confirm_button.clone();
    portal.on_click(&submit, move |s| {
        s.show(&otp_input);
        s.show(&otp_button);
    });
    let p = profile.clone();
    portal.on_click(&profile.selectors.otp_confirm_button, move |s| {
        s.hide(&p.selectors.otp_input);
        s.hide(&p.selectors.otp_confirmed);
        s.log_in(&p);
    });

    // The user takes far longer than any element timeout to type the code.
    let typing = {
        let portal = Arc::clone(&portal);
        let confirmed = profile.selectors.otp_confirmed.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(600)).await;
            portal.with_state(|s| s.show(&confirmed));
        })
    };

    let credentials = Credentials::new("0612345678", "s3cret");
    let started = tokio::time::Instant::now();
    let outcome = machine(&portal, &profile)
        .ensure_authenticated(true, Some(&credentials))
        .await
        .unwrap();
    typing.await.unwrap();

    assert!(!outcome.reused_session);
    assert!(started.elapsed() >= Duration::from_secs(600));
    assert_eq!(portal.clicks(&profile.selectors.otp_confirm_button), 1);
}

#[tokio::test]
async fn logout_is_confirmed_through_storage() {
    let profile = SiteProfile::bouygues();
    let portal = FakePortal::new(buffer(&profile));
    portal.with_state(|s| s.log_in(&profile));
    script_logout(&portal, &profile);

    let mut auth = machine(&portal, &profile);
    auth.ensure_not_authenticated().await.unwrap();

    assert_eq!(auth.state(), AuthState::Unknown);
    assert!(!auth.check_authenticated().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn click_and_wait_reports_missing_result() {
    use bytel_harvester::portal::wait::{WaitError, click_and_wait_for_element};

    let profile = SiteProfile::bouygues();
    let portal = FakePortal::new(buffer(&profile));
    portal.with_state(|s| {
        s.show("#open-modal");
        s.show("#dead-button");
    });
    portal.on_click("#open-modal", |s| s.show(".modal"));

    click_and_wait_for_element(&portal, "#open-modal", ".modal", fast_wait())
        .await
        .unwrap();
    let err = click_and_wait_for_element(&portal, "#dead-button", ".never", fast_wait())
        .await
        .unwrap_err();
    assert!(matches!(err, WaitError::Elapsed { .. }), "{err:?}");
}

#[tokio::test]
async fn stored_user_id_counts_when_no_expiry_is_stored() {
    let profile = SiteProfile::bouygues();
    let portal = FakePortal::new(buffer(&profile));
    portal.with_state(|s| s.set_storage(&profile.storage.user_id, "123456"));

    let mut auth = machine(&portal, &profile);
    assert!(auth.check_authenticated().await.unwrap());
    assert_eq!(auth.session().user_id.as_deref(), Some("123456"));
    assert!(auth.session().token_expiry.is_none());
}

#[tokio::test]
async fn login_iframe_is_followed_to_its_source() {
    let profile = SiteProfile::bouygues();
    let portal = FakePortal::new(buffer(&profile));
    script_login(&portal, &profile, "s3cret");
    let iframe = profile.selectors.login_iframe.clone();
    let src = format!("{}?service=mon-compte", profile.urls.login);
    portal.on_goto(&profile.urls.home, move |s| {
        s.show(&iframe);
        s.set_attribute(&iframe, "src", &src);
    });

    let credentials = Credentials::new("0612345678", "s3cret");
    let outcome = machine(&portal, &profile)
        .ensure_authenticated(true, Some(&credentials))
        .await
        .unwrap();

    assert!(!outcome.reused_session);
    assert_eq!(portal.visits("service=mon-compte"), 1);
    assert_eq!(portal.clicks(&profile.selectors.submit), 1);
}

#[tokio::test]
async fn unavailability_marker_means_vendor_unavailable() {
    let profile = SiteProfile::bouygues();
    let portal = FakePortal::new(buffer(&profile));
    script_login(&portal, &profile, "s3cret");
    let vendor_down = profile.selectors.vendor_down.clone();
    portal.on_click(&profile.selectors.submit, move |s| {
        s.show(&vendor_down);
        s.set_texts(&vendor_down, &["Service momentanément indisponible"]);
    });

    let credentials = Credentials::new("0612345678", "s3cret");
    let mut auth = machine(&portal, &profile);
    let err = auth
        .ensure_authenticated(true, Some(&credentials))
        .await
        .unwrap_err();

    match &err {
        HarvestError::VendorUnavailable { stage, detail } => {
            assert_eq!(*stage, "login_outcome");
            assert!(detail.contains("indisponible"), "{detail}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.code(), "VENDOR_DOWN");
    assert_eq!(auth.state(), AuthState::Failed);
}

#[tokio::test]
async fn bad_credentials_text_fails_authentication() {
    let profile = SiteProfile::bouygues();
    let portal = FakePortal::new(buffer(&profile));
    script_login(&portal, &profile, "s3cret");
    let message = format!("Erreur : {}.", profile.bad_credentials_text);
    portal.on_click(&profile.selectors.submit, move |s| {
        s.set_texts("body", &[message.as_str()]);
    });

    let credentials = Credentials::new("0612345678", "s3cret");
    let err = machine(&portal, &profile)
        .ensure_authenticated(true, Some(&credentials))
        .await
        .unwrap_err();

    assert!(matches!(err, HarvestError::AuthenticationFailed(_)), "{err:?}");
}

#[tokio::test(start_paused = true)]
async fn session_check_waits_out_a_pending_one_time_code() {
    let profile = SiteProfile::bouygues();
    let portal = FakePortal::new(buffer(&profile));
    portal.with_state(|s| {
        s.show(&profile.selectors.otp_input);
        s.show(&profile.selectors.otp_confirm_button);
    });
    let p = profile.clone();
    portal.on_click(&profile.selectors.otp_confirm_button, move |s| {
        s.hide(&p.selectors.otp_input);
        s.log_in(&p);
    });

    let mut auth = machine(&portal, &profile);
    {
        let check = auth.check_authenticated();
        tokio::pin!(check);

        // Neither answer is given while the code has not been entered.
        let early = tokio::time::timeout(Duration::from_secs(3600), &mut check).await;
        assert!(early.is_err());
        assert_eq!(portal.clicks(&profile.selectors.otp_confirm_button), 0);

        portal.with_state(|s| s.show(&profile.selectors.otp_confirmed));
        assert!(check.await.unwrap());
    }

    assert_eq!(auth.state(), AuthState::Authenticated);
    assert_eq!(portal.clicks(&profile.selectors.otp_confirm_button), 1);
}
