mod common;

use anyhow::Result;
use chrono::{Duration, Utc};
use diesel::prelude::*;
use mailroom::models::{ChannelConnection, FlowSession, Msg};
use mailroom::retry::{
    expire_sessions, harvest_errored_msgs, sweep_stale_connections, sweep_stale_msgs,
};
use mailroom::schema::{channel_connections, flow_sessions, msgs};
use uuid::Uuid;

use common::{acquire_db_lock, Seeded, TestApp};

async fn seed_errored_msg(
    app: &TestApp,
    seeded: &Seeded,
    channel_id: Uuid,
    (contact_id, urn_id): (Uuid, Uuid),
    age: &str,
) -> Result<Uuid> {
    let msg_id = Uuid::new_v4();
    app.execute(format!(
        "INSERT INTO msgs (id, org_id, channel_id, contact_id, contact_urn_id, urn, text, status, error_count, next_attempt, created_on)
         VALUES ('{msg_id}', '{org}', '{channel_id}', '{contact_id}', '{urn_id}', 'tel:+12065550100', 'hello', 'E', 1,
                 NOW() - INTERVAL '1 minute', NOW() - INTERVAL '{age}');",
        org = seeded.org_id,
    ))
    .await?;
    Ok(msg_id)
}

async fn load_msg(app: &TestApp, msg_id: Uuid) -> Result<Msg> {
    app.with_conn(move |conn| Ok(msgs::table.find(msg_id).first::<Msg>(conn)?))
        .await
}

#[tokio::test]
async fn errored_messages_are_retried_or_failed() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };
    let seeded = app.seed_org().await?;
    let contact = app.seed_contact(seeded.org_id, "Cathy", "+12065550100").await?;

    let removed_channel = Uuid::new_v4();
    app.execute(format!(
        "INSERT INTO channels (id, org_id, name, channel_type, schemes, is_active)
         VALUES ('{removed_channel}', '{org}', 'Old', 'T', '{{tel}}', FALSE);",
        org = seeded.org_id,
    ))
    .await?;

    let fresh = seed_errored_msg(&app, &seeded, seeded.channel_id, contact, "1 hour").await?;
    let too_old = seed_errored_msg(&app, &seeded, seeded.channel_id, contact, "30 days").await?;
    let orphaned = seed_errored_msg(&app, &seeded, removed_channel, contact, "1 hour").await?;

    let summary = harvest_errored_msgs(&app.state, Utc::now()).await?;
    assert_eq!(summary.harvested, 3);
    assert_eq!(summary.retried, 1);
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.errors, 0);

    let retried = load_msg(&app, fresh).await?;
    assert_eq!(retried.status, "W");
    assert_eq!(retried.external_id, Some(format!("ext-{fresh}")));
    assert_eq!(app.sender.sent(), vec![fresh]);

    let old = load_msg(&app, too_old).await?;
    assert_eq!(old.status, "F");
    assert_eq!(old.failed_reason.as_deref(), Some("O"));

    let orphan = load_msg(&app, orphaned).await?;
    assert_eq!(orphan.status, "F");
    assert_eq!(orphan.failed_reason.as_deref(), Some("R"));

    let again = harvest_errored_msgs(&app.state, Utc::now()).await?;
    assert_eq!(again.harvested, 0);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn messages_whose_urn_moved_fail_without_a_send() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };
    let seeded = app.seed_org().await?;
    let (contact_id, urn_id) = app.seed_contact(seeded.org_id, "Bob", "+12065550101").await?;
    let msg_id = seed_errored_msg(&app, &seeded, seeded.channel_id, (contact_id, urn_id), "1 hour").await?;

    let (other, _) = app.seed_contact(seeded.org_id, "Rob", "+12065550102").await?;
    app.execute(format!("UPDATE contact_urns SET contact_id = '{other}' WHERE id = '{urn_id}';"))
        .await?;

    let summary = harvest_errored_msgs(&app.state, Utc::now()).await?;
    assert_eq!(summary.failed, 1);
    assert!(app.sender.sent().is_empty());

    let msg = load_msg(&app, msg_id).await?;
    assert_eq!(msg.status, "F");
    assert_eq!(msg.failed_reason.as_deref(), Some("D"));

    app.cleanup().await?;
    Ok(())
}

async fn seed_connection(
    app: &TestApp,
    seeded: &Seeded,
    (contact_id, urn_id): (Uuid, Uuid),
    status: &str,
    modified_ago: &str,
) -> Result<Uuid> {
    let connection_id = Uuid::new_v4();
    app.execute(format!(
        "INSERT INTO channel_connections (id, org_id, channel_id, contact_id, contact_urn_id, status, external_id, modified_on)
         VALUES ('{connection_id}', '{org}', '{channel}', '{contact_id}', '{urn_id}', '{status}', 'call-{connection_id}',
                 NOW() - INTERVAL '{modified_ago}');",
        org = seeded.org_id,
        channel = seeded.channel_id,
    ))
    .await?;
    Ok(connection_id)
}

async fn load_connection(app: &TestApp, id: Uuid) -> Result<ChannelConnection> {
    app.with_conn(move |conn| {
        Ok(channel_connections::table
            .find(id)
            .first::<ChannelConnection>(conn)?)
    })
    .await
}

#[tokio::test]
async fn stale_open_connections_are_failed() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };
    let seeded = app.seed_org().await?;
    let contact = app.seed_contact(seeded.org_id, "Ann", "+12065550103").await?;

    let stale = seed_connection(&app, &seeded, contact, "W", "3 days").await?;
    let recent = seed_connection(&app, &seeded, contact, "R", "1 hour").await?;
    let finished = seed_connection(&app, &seeded, contact, "D", "3 days").await?;

    let swept = app
        .with_conn(|conn| Ok(sweep_stale_connections(conn, Duration::days(2), Utc::now())?))
        .await?;
    assert_eq!(swept, 1);

    let stale = load_connection(&app, stale).await?;
    assert_eq!(stale.status, "F");
    assert!(stale.ended_on.is_some());
    assert!(stale.next_attempt.is_none());
    assert_eq!(load_connection(&app, recent).await?.status, "R");
    assert_eq!(load_connection(&app, finished).await?.status, "D");

    app.cleanup().await?;
    Ok(())
}

async fn seed_msg_with_status(
    app: &TestApp,
    seeded: &Seeded,
    (contact_id, urn_id): (Uuid, Uuid),
    status: &str,
    modified_ago: &str,
) -> Result<Uuid> {
    let msg_id = Uuid::new_v4();
    app.execute(format!(
        "INSERT INTO msgs (id, org_id, channel_id, contact_id, contact_urn_id, urn, text, status, modified_on)
         VALUES ('{msg_id}', '{org}', '{channel}', '{contact_id}', '{urn_id}', 'tel:+12065550104', 'hello', '{status}',
                 NOW() - INTERVAL '{modified_ago}');",
        org = seeded.org_id,
        channel = seeded.channel_id,
    ))
    .await?;
    Ok(msg_id)
}

#[tokio::test]
async fn stale_unconfirmed_messages_are_failed() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };
    let seeded = app.seed_org().await?;
    let contact = app.seed_contact(seeded.org_id, "Dee", "+12065550104").await?;

    let wired = seed_msg_with_status(&app, &seeded, contact, "W", "3 days").await?;
    let queued = seed_msg_with_status(&app, &seeded, contact, "Q", "3 days").await?;
    let recent = seed_msg_with_status(&app, &seeded, contact, "W", "1 hour").await?;
    let sent = seed_msg_with_status(&app, &seeded, contact, "S", "3 days").await?;
    let delivered = seed_msg_with_status(&app, &seeded, contact, "D", "3 days").await?;

    let swept = app
        .with_conn(|conn| Ok(sweep_stale_msgs(conn, Duration::days(2), Utc::now())?))
        .await?;
    assert_eq!(swept, 2);

    for id in [wired, queued] {
        let msg = load_msg(&app, id).await?;
        assert_eq!(msg.status, "F");
        assert_eq!(msg.failed_reason.as_deref(), Some("O"));
        assert!(msg.next_attempt.is_none());
    }
    assert_eq!(load_msg(&app, recent).await?.status, "W");
    assert_eq!(load_msg(&app, sent).await?.status, "S");
    assert_eq!(load_msg(&app, delivered).await?.status, "D");

    // nothing left for the errored harvester to pick up
    assert_eq!(harvest_errored_msgs(&app.state, Utc::now()).await?.harvested, 0);

    app.cleanup().await?;
    Ok(())
}

async fn load_session(app: &TestApp, id: Uuid) -> Result<FlowSession> {
    app.with_conn(move |conn| Ok(flow_sessions::table.find(id).first::<FlowSession>(conn)?))
        .await
}

#[tokio::test]
async fn expired_sessions_end_and_live_calls_are_hung_up_first() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };
    let seeded = app.seed_org().await?;
    let contact = app.seed_contact(seeded.org_id, "Joe", "+12065550104").await?;
    let connection_id = seed_connection(&app, &seeded, contact, "I", "1 minute").await?;

    let plain = Uuid::new_v4();
    let on_call = Uuid::new_v4();
    let still_waiting = Uuid::new_v4();
    app.execute(format!(
        "INSERT INTO flow_sessions (id, org_id, contact_id, status, connection_id, wait_expires_on) VALUES
         ('{plain}', '{org}', '{contact_id}', 'W', NULL, NOW() - INTERVAL '1 minute'),
         ('{on_call}', '{org}', '{contact_id}', 'W', '{connection_id}', NOW() - INTERVAL '1 minute'),
         ('{still_waiting}', '{org}', '{contact_id}', 'W', NULL, NOW() + INTERVAL '1 hour');",
        org = seeded.org_id,
        contact_id = contact.0,
    ))
    .await?;

    app.calls.set_failing(true);
    let summary = expire_sessions(&app.state, Utc::now()).await?;
    assert_eq!(summary.expired, 1);
    assert_eq!(summary.hung_up, 0);
    assert_eq!(summary.skipped, 1);
    assert_eq!(load_session(&app, plain).await?.status, "X");
    assert_eq!(load_session(&app, on_call).await?.status, "W");
    assert_eq!(load_connection(&app, connection_id).await?.status, "I");

    app.calls.set_failing(false);
    let summary = expire_sessions(&app.state, Utc::now()).await?;
    assert_eq!(summary.hung_up, 1);
    assert_eq!(summary.skipped, 0);
    assert_eq!(app.calls.hangups(), vec![format!("call-{connection_id}")]);

    let session = load_session(&app, on_call).await?;
    assert_eq!(session.status, "X");
    assert!(session.ended_on.is_some());
    assert_eq!(load_connection(&app, connection_id).await?.status, "D");
    assert_eq!(load_session(&app, still_waiting).await?.status, "W");

    app.cleanup().await?;
    Ok(())
}
