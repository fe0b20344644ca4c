//! Shared X.509 fixtures: a miniature DICE-style hierarchy generated with
//! openssl, mirroring the layout of a cached device bundle.

#![allow(dead_code)]

use std::io::Write;

use openssl::asn1::Asn1Time;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{AuthorityKeyIdentifier, BasicConstraints, SubjectKeyIdentifier};
use openssl::x509::{X509Builder, X509NameBuilder, X509};

pub struct TestAuthority {
    pub key: PKey<Private>,
    pub cert: X509,
}

pub fn p384_key() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::SECP384R1).unwrap();
    PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

/// Generate a self-signed CA certificate carrying an SKI.
pub fn authority(cn: &str) -> TestAuthority {
    let key = p384_key();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", cn).unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();

    let not_before = Asn1Time::days_from_now(0).unwrap();
    let not_after = Asn1Time::days_from_now(3650).unwrap();
    builder.set_not_before(&not_before).unwrap();
    builder.set_not_after(&not_after).unwrap();

    let bc = BasicConstraints::new().critical().ca().build().unwrap();
    builder.append_extension(bc).unwrap();

    let ski = {
        let ctx = builder.x509v3_context(None, None);
        SubjectKeyIdentifier::new().build(&ctx).unwrap()
    };
    builder.append_extension(ski).unwrap();

    builder.sign(&key, MessageDigest::sha384()).unwrap();
    TestAuthority {
        key,
        cert: builder.build(),
    }
}

/// Generate a certificate for `key` signed by `issuer`, carrying an SKI and
/// (optionally) an AKI copied from the issuer's SKI.
pub fn issued_cert(cn: &str, key: &PKey<Private>, issuer: &TestAuthority, with_aki: bool) -> X509 {
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", cn).unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(issuer.cert.subject_name()).unwrap();
    builder.set_pubkey(key).unwrap();

    let not_before = Asn1Time::days_from_now(0).unwrap();
    let not_after = Asn1Time::days_from_now(3650).unwrap();
    builder.set_not_before(&not_before).unwrap();
    builder.set_not_after(&not_after).unwrap();

    let ski = {
        let ctx = builder.x509v3_context(Some(&issuer.cert), None);
        SubjectKeyIdentifier::new().build(&ctx).unwrap()
    };
    builder.append_extension(ski).unwrap();

    if with_aki {
        let aki = {
            let ctx = builder.x509v3_context(Some(&issuer.cert), None);
            AuthorityKeyIdentifier::new().keyid(true).build(&ctx).unwrap()
        };
        builder.append_extension(aki).unwrap();
    }

    builder.sign(&issuer.key, MessageDigest::sha384()).unwrap();
    builder.build()
}

/// Certificate without an SKI extension, for missing-identifier cases.
pub fn cert_without_ski(cn: &str, key: &PKey<Private>, issuer: &TestAuthority) -> X509 {
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", cn).unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(issuer.cert.subject_name()).unwrap();
    builder.set_pubkey(key).unwrap();

    let not_before = Asn1Time::days_from_now(0).unwrap();
    let not_after = Asn1Time::days_from_now(3650).unwrap();
    builder.set_not_before(&not_before).unwrap();
    builder.set_not_after(&not_after).unwrap();

    builder.sign(&issuer.key, MessageDigest::sha384()).unwrap();
    builder.build()
}

/// A device-presented enrollment certificate whose issuer CN carries the
/// DICE enrollment parameters (`<vendor>:<family>:ER:<svn>:<uid>`).
pub fn device_enrollment_fixture(
    family: &str,
    svn: &str,
    uid: &str,
    device_key: &PKey<Private>,
) -> (TestAuthority, X509) {
    let issuer_cn = format!("Intel:{family}:ER:{svn}:{uid}");
    let issuer = authority(&issuer_cn);
    let cert = issued_cert("device enrollment", device_key, &issuer, true);
    (issuer, cert)
}

/// Build an in-memory zip bundle from `(path, content)` pairs.
pub fn build_bundle(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (path, content) in files {
        writer
            .start_file(*path, zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap().into_inner()
}
