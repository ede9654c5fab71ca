//! End-to-end scenarios against the fake transport.

use tpmlink_tcti::fake::{FAKE_MAGIC, FAKE_VERSION};
use tpmlink_tcti::header::{cc, TPM_ST_NO_SESSIONS};
use tpmlink_tcti::{
    exchange, FakeTcti, Identity, LifecycleState, Operation, TctiBackend, TctiContext, TctiError,
    TctiInit, TctiSpec, Timeout, TpmHeader, YIELDED_RESPONSE,
};

fn policy_ac_send_select() -> Vec<u8> {
    TpmHeader::command(TPM_ST_NO_SESSIONS, cc::POLICY_AC_SEND_SELECT, &[]).unwrap()
}

fn setup() -> TctiContext<FakeTcti> {
    TctiContext::<FakeTcti>::initialize(cc::POLICY_AC_SEND_SELECT).unwrap()
}

#[test]
fn test_sizing_query_is_stable() {
    let first = TctiContext::<FakeTcti>::context_size();
    let second = FakeTcti::context_size();
    assert_eq!(first, second);
    assert_eq!(first, std::mem::size_of::<FakeTcti>());
}

#[test]
fn test_initialize_sets_identity() {
    let ctx = setup();
    let backend = ctx.backend().unwrap();
    assert_eq!(backend.identity(), Identity::new(FAKE_MAGIC, FAKE_VERSION));
    assert_eq!(ctx.expected_identity(), FakeTcti::IDENTITY);
    assert_eq!(ctx.state(), LifecycleState::Ready);
}

#[test]
fn test_expected_command_round_trip() {
    let mut ctx = setup();

    ctx.transmit(&policy_ac_send_select()).unwrap();
    assert_eq!(ctx.state(), LifecycleState::AwaitingResponse);

    let size = ctx.receive(None, Timeout::Block).unwrap();
    assert_eq!(size, 10);

    let mut response = vec![0u8; size];
    let filled = ctx.receive(Some(&mut response), Timeout::Block).unwrap();
    assert_eq!(filled, 10);
    assert_eq!(
        response,
        vec![0x80, 0x01, 0x00, 0x00, 0x00, 0x0A, 0x00, 0x00, 0x00, 0x00]
    );
    assert_eq!(ctx.state(), LifecycleState::Ready);
    assert_eq!(ctx.backend().unwrap().transmits(), 1);
}

#[test]
#[should_panic(expected = "does not match expected")]
fn test_unexpected_command_is_contract_failure() {
    let mut ctx = setup();
    let startup = TpmHeader::command(TPM_ST_NO_SESSIONS, cc::STARTUP, &[0x00, 0x00]).unwrap();
    let _ = ctx.transmit(&startup);
}

#[test]
fn test_receive_is_repeatable() {
    let mut fake = FakeTcti::new(cc::POLICY_AC_SEND_SELECT);
    let mut first = [0u8; 10];
    let mut second = [0u8; 10];
    fake.receive(Some(&mut first), Timeout::Block).unwrap();
    fake.receive(Some(&mut second), Timeout::from_millis(1)).unwrap();
    assert_eq!(first, second);
    assert_eq!(first, YIELDED_RESPONSE);
    assert_eq!(
        fake.receive(None, Timeout::Block).unwrap(),
        YIELDED_RESPONSE.len()
    );
}

#[test]
fn test_repeated_size_queries_agree() {
    let mut ctx = setup();
    ctx.transmit(&policy_ac_send_select()).unwrap();
    let sizes: Vec<usize> = (0..3)
        .map(|_| ctx.receive(None, Timeout::Block).unwrap())
        .collect();
    assert_eq!(sizes, vec![10, 10, 10]);
    assert_eq!(ctx.state(), LifecycleState::AwaitingResponse);
}

#[test]
fn test_corrupted_magic_is_invalid_context() {
    let fake = FakeTcti::new(cc::POLICY_AC_SEND_SELECT)
        .with_identity(Identity::new(0xDEAD_BEEF, FAKE_VERSION));
    let mut ctx = TctiContext::with_expected(fake, FakeTcti::IDENTITY);

    assert!(matches!(
        ctx.transmit(&policy_ac_send_select()),
        Err(TctiError::InvalidContext {
            expected_magic: FAKE_MAGIC,
            magic: 0xDEAD_BEEF,
            ..
        })
    ));
    assert_eq!(ctx.backend().unwrap().transmits(), 0);
}

#[test]
fn test_corrupted_version_is_invalid_context() {
    let fake = FakeTcti::new(cc::POLICY_AC_SEND_SELECT)
        .with_identity(Identity::new(FAKE_MAGIC, FAKE_VERSION + 1));
    let mut ctx = TctiContext::with_expected(fake, FakeTcti::IDENTITY);
    assert!(matches!(
        ctx.set_locality(0),
        Err(TctiError::InvalidContext { version: 2, .. })
    ));
}

#[test]
fn test_optional_operations_unsupported() {
    let mut ctx = setup();
    assert!(matches!(
        ctx.get_poll_handles(),
        Err(TctiError::NotImplemented(Operation::GetPollHandles))
    ));
    assert!(matches!(
        ctx.set_locality(2),
        Err(TctiError::NotImplemented(Operation::SetLocality))
    ));
    ctx.transmit(&policy_ac_send_select()).unwrap();
    assert!(matches!(
        ctx.cancel(),
        Err(TctiError::NotImplemented(Operation::Cancel))
    ));
    assert_eq!(ctx.state(), LifecycleState::AwaitingResponse);
}

#[test]
fn test_finalize_then_transmit_rejected() {
    let mut ctx = setup();
    ctx.finalize().unwrap();
    assert!(matches!(
        ctx.transmit(&policy_ac_send_select()),
        Err(TctiError::BadSequence {
            op: Operation::Transmit,
            state: LifecycleState::Finalized
        })
    ));
    assert!(matches!(
        ctx.finalize(),
        Err(TctiError::BadSequence { .. })
    ));
}

#[test]
fn test_yielded_response_is_not_a_retry_code() {
    // The fixed response carries code 0 even though it stands for a yield.
    let mut ctx = setup();
    let response = exchange(&mut ctx, &policy_ac_send_select(), Timeout::Block).unwrap();
    assert_eq!(response.bytes, YIELDED_RESPONSE.to_vec());
    assert!(response.code().is_success());
    assert!(!response.code().is_retry());
}

#[test]
fn test_dyn_context_from_tcti_string() {
    let spec: TctiSpec = "fake:code=0x196".parse().unwrap();
    let mut ctx = spec.open().unwrap();
    let response = exchange(&mut ctx, &policy_ac_send_select(), Timeout::Block).unwrap();
    assert_eq!(response.header.size, 10);
    ctx.finalize().unwrap();
}
