//! Fixture documents, throw-away identities and signature verification helpers.

#![allow(dead_code)]

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{X509NameBuilder, X509};
use pdf_signer::{IndirectObject, ObjectId, ObjectSerializer, PdfObject, SigningIdentity};
use regex::bytes::Regex;
use sha2::{Digest, Sha256};

pub const LETTER_BOX: &str = "0 0 612 792";
pub const A4_BOX: &str = "0 0 595.28 841.89";

/// Writes `bodies` as objects `1..=n` with a classic xref table and a trailer rooted at `root`.
pub fn assemble(bodies: &[String], root: u32, trailer_extra: &str) -> Vec<u8> {
    let mut out = b"%PDF-1.7\n%\xE2\xE3\xCF\xD3\n".to_vec();
    let mut offsets = Vec::with_capacity(bodies.len());
    {
        let mut serializer = ObjectSerializer::new(&mut out);
        for (index, body) in bodies.iter().enumerate() {
            let object = IndirectObject::new(
                ObjectId::new(index as u32 + 1),
                PdfObject::raw(body.as_bytes()),
            );
            offsets.push(serializer.write_indirect(&object).offset);
        }
    }

    let xref = out.len();
    out.extend_from_slice(format!("xref\n0 {}\n0000000000 65535 f \n", bodies.len() + 1).as_bytes());
    for offset in offsets {
        out.extend_from_slice(format!("{offset:010} 00000 n \n").as_bytes());
    }
    out.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root {root} 0 R{trailer_extra} >>\nstartxref\n{xref}\n%%EOF\n",
            bodies.len() + 1
        )
        .as_bytes(),
    );
    out
}

/// Catalog (1), page tree (2) and `page_count` blank pages (3..).
pub fn document(page_count: usize, media_box: &str) -> Vec<u8> {
    let kids = (0..page_count)
        .map(|i| format!("{} 0 R", i + 3))
        .collect::<Vec<_>>()
        .join(" ");
    let mut bodies = vec![
        "<< /Type /Catalog /Pages 2 0 R >>".to_string(),
        format!("<< /Type /Pages /Kids [{kids}] /Count {page_count} /MediaBox [{media_box}] >>"),
    ];
    for _ in 0..page_count {
        bodies.push("<< /Type /Page /Parent 2 0 R /Resources << >> >>".to_string());
    }
    assemble(&bodies, 1, "")
}

pub fn identity(common_name: &str) -> SigningIdentity {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", common_name).unwrap();
    name.append_entry_by_text("O", "pdfpipe tests").unwrap();
    let name = name.build();

    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();
    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder
        .set_serial_number(&serial.to_asn1_integer().unwrap())
        .unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(30).unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    SigningIdentity::new(builder.build(), key, Vec::new())
}

/// Every `/ByteRange` in the file, in file order.
pub fn byte_ranges(pdf: &[u8]) -> Vec<[usize; 4]> {
    let pattern = Regex::new(r"/ByteRange \[(\d+) (\d+) (\d+) (\d+)\]").unwrap();
    pattern
        .captures_iter(pdf)
        .map(|caps| {
            let n = |i: usize| -> usize {
                std::str::from_utf8(&caps[i]).unwrap().parse().unwrap()
            };
            [n(1), n(2), n(3), n(4)]
        })
        .collect()
}

pub fn covered_bytes(pdf: &[u8], range: [usize; 4]) -> Vec<u8> {
    [
        &pdf[range[0]..range[0] + range[1]],
        &pdf[range[2]..range[2] + range[3]],
    ]
    .concat()
}

/// Decodes the `/Contents` hex between the two spans and strips the zero padding.
pub fn signature_der(pdf: &[u8], range: [usize; 4]) -> Vec<u8> {
    let hex_digits = &pdf[range[1] + 1..range[2] - 1];
    let der = hex::decode(hex_digits).unwrap();
    let len = match der[1] {
        short if short & 0x80 == 0 => short as usize + 2,
        long => {
            let octets = (long & 0x7f) as usize;
            let len = der[2..2 + octets]
                .iter()
                .fold(0usize, |acc, &b| (acc << 8) | b as usize);
            len + 2 + octets
        }
    };
    der[..len].to_vec()
}

/// Verifies the CMS signature for `range` and returns the SHA-256 of the covered bytes (hex).
pub fn verify(pdf: &[u8], range: [usize; 4], identity: &SigningIdentity) -> String {
    let covered = covered_bytes(pdf, range);
    let pkcs7 = Pkcs7::from_der(&signature_der(pdf, range)).unwrap();
    let store = X509StoreBuilder::new().unwrap().build();
    let mut certs = Stack::new().unwrap();
    certs.push(identity.certificate().clone()).unwrap();
    pkcs7
        .verify(
            &certs,
            &store,
            Some(covered.as_slice()),
            None,
            Pkcs7Flags::NOVERIFY | Pkcs7Flags::BINARY,
        )
        .expect("signature verifies over the byte range");

    let signers = pkcs7.signers(&certs, Pkcs7Flags::empty()).unwrap();
    assert_eq!(
        signers.get(0).expect("one signer").to_der().unwrap(),
        identity.certificate().to_der().unwrap()
    );
    hex::encode(Sha256::digest(&covered))
}

/// Body of the newest definition of object `number`.
pub fn newest_object(pdf: &[u8], number: u32) -> String {
    let text = String::from_utf8_lossy(pdf);
    let header = format!("\n{number} 0 obj\n");
    let start = text.rfind(&header).expect("object present") + header.len();
    let end = start + text[start..].find("endobj").expect("endobj present");
    text[start..end].trim().to_string()
}
