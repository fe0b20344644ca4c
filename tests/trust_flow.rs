//! Trust-flow selection and chain assembly against a synthetic DICE
//! hierarchy.

mod common;

use spdm_onboarding::error::TrustError;
use spdm_onboarding::trust::archive::{assemble_chain, ArchivePaths};
use spdm_onboarding::trust::{parse_svn, select_flow, DeviceId, Family, FlowInputs, PufType, TrustFlow};

use common::{authority, build_bundle, cert_without_ski, device_enrollment_fixture, issued_cert, p384_key};

fn inputs<'a>(
    puf_type: PufType,
    svn: &'a str,
    force_enrollment: bool,
    device_id_cert: Option<&'a [u8]>,
    enrollment_cert: &'a openssl::x509::X509,
    ipcs_enrollment_cert: Option<&'a [u8]>,
) -> FlowInputs<'a> {
    FlowInputs {
        puf_type,
        svn,
        force_enrollment,
        device_id_cert,
        enrollment_cert,
        ipcs_enrollment_cert,
    }
}

#[test]
fn iid_flow_is_unconditional() {
    let device_key = p384_key();
    let (_, enrollment) = device_enrollment_fixture("agilex", "07", "AA", &device_key);

    for svn in ["00", "01", "ff"] {
        for force in [false, true] {
            let flow = select_flow(&inputs(PufType::Iid, svn, force, None, &enrollment, None)).unwrap();
            assert_eq!(flow, TrustFlow::Iid);
        }
    }
}

#[test]
fn svn_zero_without_force_selects_device_id() {
    let device_key = p384_key();
    let (issuer, enrollment) = device_enrollment_fixture("agilex", "00", "AA", &device_key);
    // Cached device-id certificate holds the same public key, so its SKI
    // matches the device certificate's SKI.
    let device_id = issued_cert("deviceid", &device_key, &issuer, false);
    let device_id_der = device_id.to_der().unwrap();

    let flow = select_flow(&inputs(
        PufType::Efuse,
        "00",
        false,
        Some(&device_id_der),
        &enrollment,
        None,
    ))
    .unwrap();
    assert_eq!(flow, TrustFlow::DeviceId);
}

#[test]
fn nonzero_svn_selects_enrollment() {
    let device_key = p384_key();
    let (issuer, enrollment) = device_enrollment_fixture("agilex", "01", "AA", &device_key);
    let ipcs_der = issuer.cert.to_der().unwrap();

    let flow = select_flow(&inputs(
        PufType::Efuse,
        "01",
        false,
        None,
        &enrollment,
        Some(&ipcs_der),
    ))
    .unwrap();
    assert_eq!(flow, TrustFlow::Enrollment);
}

#[test]
fn force_enrollment_overrides_svn_zero() {
    let device_key = p384_key();
    let (issuer, enrollment) = device_enrollment_fixture("agilex", "00", "AA", &device_key);
    let ipcs_der = issuer.cert.to_der().unwrap();

    let flow = select_flow(&inputs(
        PufType::Intel,
        "00",
        true,
        None,
        &enrollment,
        Some(&ipcs_der),
    ))
    .unwrap();
    assert_eq!(flow, TrustFlow::Enrollment);
}

#[test]
fn enrollment_aki_mismatch_is_hard_failure() {
    let device_key = p384_key();
    let (_, enrollment) = device_enrollment_fixture("agilex", "01", "AA", &device_key);
    // A different authority: its SKI cannot match the device cert's AKI.
    let stranger = authority("Intel:agilex:ER:01:BB");
    let stranger_der = stranger.cert.to_der().unwrap();

    let result = select_flow(&inputs(
        PufType::Efuse,
        "01",
        false,
        None,
        &enrollment,
        Some(&stranger_der),
    ));
    assert!(matches!(result, Err(TrustError::TrustChainBroken(_))));
}

#[test]
fn absent_ipcs_enrollment_cert_is_hard_failure() {
    let device_key = p384_key();
    let (_, enrollment) = device_enrollment_fixture("agilex", "01", "AA", &device_key);

    let result = select_flow(&inputs(PufType::Efuse, "01", false, None, &enrollment, None));
    assert!(matches!(result, Err(TrustError::TrustChainBroken(_))));
}

#[test]
fn device_id_ski_mismatch_is_hard_failure() {
    let device_key = p384_key();
    let (issuer, enrollment) = device_enrollment_fixture("agilex", "00", "AA", &device_key);
    // Cached device-id certificate for a different key.
    let other_key = p384_key();
    let device_id = issued_cert("deviceid", &other_key, &issuer, false);
    let device_id_der = device_id.to_der().unwrap();

    let result = select_flow(&inputs(
        PufType::Efuse,
        "00",
        false,
        Some(&device_id_der),
        &enrollment,
        None,
    ));
    assert!(matches!(result, Err(TrustError::TrustChainBroken(_))));
}

#[test]
fn missing_ski_is_hard_failure_not_fallback() {
    let device_key = p384_key();
    let (issuer, enrollment) = device_enrollment_fixture("agilex", "00", "AA", &device_key);
    let bare = cert_without_ski("deviceid", &device_key, &issuer);
    let bare_der = bare.to_der().unwrap();

    let result = select_flow(&inputs(
        PufType::Efuse,
        "00",
        false,
        Some(&bare_der),
        &enrollment,
        None,
    ));
    assert!(matches!(result, Err(TrustError::TrustChainBroken(_))));
}

#[test]
fn unsupported_puf_type_is_rejected() {
    let device_key = p384_key();
    let (_, enrollment) = device_enrollment_fixture("agilex", "00", "AA", &device_key);

    let result = select_flow(&inputs(PufType::IidUser, "00", false, None, &enrollment, None));
    assert!(matches!(
        result,
        Err(TrustError::UnsupportedPufType(PufType::IidUser))
    ));
}

#[test]
fn svn_parsed_from_issuer_cn() {
    let device_key = p384_key();
    let (_, enrollment) = device_enrollment_fixture("agilex", "0A", "AA", &device_key);
    assert_eq!(parse_svn(&enrollment).unwrap(), "0a");
}

#[test]
fn issuer_without_enrollment_params_has_no_svn() {
    let device_key = p384_key();
    let issuer = authority("plain issuer");
    let cert = issued_cert("leaf", &device_key, &issuer, true);
    assert!(matches!(
        parse_svn(&cert),
        Err(TrustError::TrustChainBroken(_))
    ));
}

#[test]
fn device_id_chain_assembled_from_bundle() {
    let device_key = p384_key();
    let (issuer, enrollment) = device_enrollment_fixture("agilex", "00", "AA", &device_key);
    let device_id_der = issued_cert("deviceid", &device_key, &issuer, false)
        .to_der()
        .unwrap();

    let bundle = build_bundle(&[
        ("auth/DICE_RootCA.cer", b"root-ca".as_slice()),
        ("auth/IPCS_agilex.cer", b"ipcs-agilex".as_slice()),
        ("efuse/deviceid.cer", &device_id_der),
    ]);

    let device = DeviceId::new(Family::Agilex, "0011223344556677");
    let assembled =
        assemble_chain(&bundle, &device, PufType::Efuse, "00", &enrollment, false).unwrap();

    assert_eq!(assembled.flow, TrustFlow::DeviceId);
    assert_eq!(assembled.certificates.len(), 3);
    assert_eq!(assembled.certificates[0], b"root-ca");
    assert_eq!(assembled.certificates[1], b"ipcs-agilex");
    assert_eq!(assembled.certificates[2], device_id_der);
}

#[test]
fn enrollment_chain_ends_with_device_certificate() {
    let device_key = p384_key();
    let (issuer, enrollment) = device_enrollment_fixture("agilex", "01", "AA", &device_key);
    let ipcs_der = issuer.cert.to_der().unwrap();

    let bundle = build_bundle(&[
        ("auth/DICE_RootCA.cer", b"root-ca".as_slice()),
        ("auth/IPCS_agilex.cer", b"ipcs-agilex".as_slice()),
        ("efuse/enrollment_01.cer", &ipcs_der),
    ]);

    let device = DeviceId::new(Family::Agilex, "0011223344556677");
    let assembled =
        assemble_chain(&bundle, &device, PufType::Efuse, "01", &enrollment, false).unwrap();

    assert_eq!(assembled.flow, TrustFlow::Enrollment);
    assert_eq!(assembled.certificates.len(), 4);
    assert_eq!(assembled.certificates[2], ipcs_der);
    assert_eq!(assembled.certificates[3], enrollment.to_der().unwrap());
}

#[test]
fn iid_chain_uses_iiduds_certificate() {
    let device_key = p384_key();
    let (_, enrollment) = device_enrollment_fixture("agilex", "00", "AA", &device_key);

    let bundle = build_bundle(&[
        ("auth/DICE_RootCA.cer", b"root-ca".as_slice()),
        ("auth/IPCS_agilex.cer", b"ipcs-agilex".as_slice()),
        ("efuse/iiduds.cer", b"iiduds".as_slice()),
    ]);

    let device = DeviceId::new(Family::Agilex, "0011223344556677");
    let assembled =
        assemble_chain(&bundle, &device, PufType::Iid, "00", &enrollment, false).unwrap();

    assert_eq!(assembled.flow, TrustFlow::Iid);
    assert_eq!(assembled.certificates[2], b"iiduds");
}

#[test]
fn missing_root_certificate_fails_assembly() {
    let device_key = p384_key();
    let (issuer, enrollment) = device_enrollment_fixture("agilex", "00", "AA", &device_key);
    let device_id_der = issued_cert("deviceid", &device_key, &issuer, false)
        .to_der()
        .unwrap();

    let bundle = build_bundle(&[
        ("auth/IPCS_agilex.cer", b"ipcs-agilex".as_slice()),
        ("efuse/deviceid.cer", &device_id_der),
    ]);

    let device = DeviceId::new(Family::Agilex, "0011223344556677");
    let result = assemble_chain(&bundle, &device, PufType::Efuse, "00", &enrollment, false);
    assert!(matches!(
        result,
        Err(TrustError::RequiredFileMissing(path)) if path == "auth/DICE_RootCA.cer"
    ));
}

#[test]
fn archive_paths_follow_anchor_layout() {
    let intel = ArchivePaths::new(PufType::Intel, "02", Family::Agilex).unwrap();
    assert_eq!(intel.device_id_cer(), "puf/deviceid.cer");
    assert_eq!(intel.enrollment_device_id_cer(), "puf/enrollment_02.cer");

    let iid = ArchivePaths::new(PufType::Iid, "00", Family::Stratix10).unwrap();
    assert_eq!(iid.ipcs_family_cer(), "auth/IPCS_s10.cer");
    assert_eq!(iid.efuse_iiduds_cer().unwrap(), "efuse/iiduds.cer");
    assert!(ArchivePaths::new(PufType::Efuse, "00", Family::Agilex)
        .unwrap()
        .efuse_iiduds_cer()
        .is_err());
}
