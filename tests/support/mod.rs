//! Fixtures shared by the service and CLI tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use cdp_pipe::Dispatcher;
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkcs12::Pkcs12;
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{X509NameBuilder, X509};
use serde_json::{json, Value};
use tokio::io::{duplex, split, AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Catalog, page tree and one Letter page, with an exact classic xref table.
pub fn one_page_pdf() -> Vec<u8> {
    let bodies = [
        "<< /Type /Catalog /Pages 2 0 R >>",
        "<< /Type /Pages /Kids [3 0 R] /Count 1 /MediaBox [0 0 612 792] >>",
        "<< /Type /Page /Parent 2 0 R /Resources << >> >>",
    ];
    let mut pdf = b"%PDF-1.7\n".to_vec();
    let mut offsets = Vec::new();
    for (index, body) in bodies.iter().enumerate() {
        offsets.push(pdf.len());
        pdf.extend_from_slice(format!("{} 0 obj\n{body}\nendobj\n", index + 1).as_bytes());
    }
    let xref = pdf.len();
    pdf.extend_from_slice(format!("xref\n0 {}\n0000000000 65535 f \n", bodies.len() + 1).as_bytes());
    for offset in offsets {
        pdf.extend_from_slice(format!("{offset:010} 00000 n \n").as_bytes());
    }
    pdf.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{xref}\n%%EOF\n",
            bodies.len() + 1
        )
        .as_bytes(),
    );
    pdf
}

/// Self-signed RSA certificate and key.
pub fn certificate(common_name: &str) -> (X509, PKey<Private>) {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", common_name).unwrap();
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
    (builder.build(), key)
}

/// Writes a password-protected PKCS#12 bundle into `dir` and returns its path and certificate.
pub fn write_p12(dir: &Path, common_name: &str, password: &str) -> (PathBuf, X509) {
    let (cert, key) = certificate(common_name);
    let der = Pkcs12::builder()
        .name(common_name)
        .pkey(&key)
        .cert(&cert)
        .build2(password)
        .unwrap()
        .to_der()
        .unwrap();
    let path = dir.join(format!("{}.p12", common_name.replace(' ', "-")));
    std::fs::write(&path, der).unwrap();
    (path, cert)
}

/// Every `/ByteRange` in the file, in file order.
pub fn byte_ranges(pdf: &[u8]) -> Vec<[usize; 4]> {
    let text = String::from_utf8_lossy(pdf);
    text.match_indices("/ByteRange [")
        .map(|(start, marker)| {
            let rest = &text[start + marker.len()..];
            let end = rest.find(']').expect("closing bracket");
            let numbers: Vec<usize> = rest[..end]
                .split_whitespace()
                .map(|n| n.parse().unwrap())
                .collect();
            [numbers[0], numbers[1], numbers[2], numbers[3]]
        })
        .collect()
}

/// Checks the detached CMS for `range` against `cert`.
pub fn verify(pdf: &[u8], range: [usize; 4], cert: &X509) {
    assert_eq!(range[0], 0);
    assert_eq!(range[2] + range[3], pdf.len(), "range must reach end of file");
    let covered = [
        &pdf[range[0]..range[0] + range[1]],
        &pdf[range[2]..range[2] + range[3]],
    ]
    .concat();

    let der = hex::decode(&pdf[range[1] + 1..range[2] - 1]).unwrap();
    let len = match der[1] {
        short if short & 0x80 == 0 => short as usize + 2,
        long => {
            let octets = (long & 0x7f) as usize;
            der[2..2 + octets]
                .iter()
                .fold(0usize, |acc, &b| (acc << 8) | b as usize)
                + 2
                + octets
        }
    };
    let pkcs7 = Pkcs7::from_der(&der[..len]).unwrap();
    let store = X509StoreBuilder::new().unwrap().build();
    let mut certs = Stack::new().unwrap();
    certs.push(cert.clone()).unwrap();
    pkcs7
        .verify(
            &certs,
            &store,
            Some(covered.as_slice()),
            None,
            Pkcs7Flags::NOVERIFY | Pkcs7Flags::BINARY,
        )
        .expect("signature verifies over the byte range");
}

/// How the fake browser answers `Page.printToPDF`.
#[derive(Clone)]
pub enum PrintReply {
    Pdf(Vec<u8>),
    Error(&'static str),
}

/// Every frame the fake received, in arrival order.
#[derive(Clone, Default)]
pub struct FrameLog(Arc<Mutex<Vec<Value>>>);

impl FrameLog {
    pub fn count(&self, method: &str) -> usize {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|frame| frame["method"] == method)
            .count()
    }
}

/// Answers the CDP commands a render issues over an in-memory duplex.
pub fn fake_chrome(print: PrintReply, zones: Value) -> (Dispatcher, FrameLog) {
    let (client, server) = duplex(1 << 20);
    let (client_r, client_w) = split(client);
    let dispatcher = Dispatcher::new(client_r, client_w);
    let log = FrameLog::default();
    let task_log = log.clone();

    tokio::spawn(async move {
        let (server_r, mut server_w) = split(server);
        let mut reader = BufReader::new(server_r);
        loop {
            let mut buf = Vec::new();
            match reader.read_until(0, &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            if buf.last() == Some(&0) {
                buf.pop();
            }
            let frame: Value = serde_json::from_slice(&buf).expect("client sent valid json");
            task_log.0.lock().unwrap().push(frame.clone());

            let result = match frame["method"].as_str().unwrap_or_default() {
                "Browser.getVersion" => json!({
                    "protocolVersion": "1.3",
                    "product": "HeadlessChrome/124.0.0.0",
                    "revision": "@0",
                    "userAgent": "Mozilla/5.0 HeadlessChrome",
                    "jsVersion": "12.4"
                }),
                "Target.createTarget" => json!({ "targetId": "T1" }),
                "Target.attachToTarget" => json!({ "sessionId": "S1" }),
                "Page.getFrameTree" => json!({ "frameTree": { "frame": { "id": "F1" } } }),
                "Runtime.evaluate" => {
                    let expression = frame["params"]["expression"].as_str().unwrap_or_default();
                    if expression == "document.readyState" {
                        json!({ "result": { "type": "string", "value": "complete" } })
                    } else if expression.contains("signature-area-") {
                        json!({ "result": { "type": "object", "value": zones.clone() } })
                    } else {
                        json!({ "result": { "type": "undefined" } })
                    }
                }
                "Page.printToPDF" => match &print {
                    PrintReply::Pdf(pdf) => json!({ "data": STANDARD.encode(pdf) }),
                    PrintReply::Error(message) => {
                        let reply = json!({
                            "id": frame["id"],
                            "error": { "code": -32000, "message": message }
                        });
                        write_frame(&mut server_w, &reply).await;
                        continue;
                    }
                },
                "Target.closeTarget" => json!({ "success": true }),
                _ => json!({}),
            };
            write_frame(&mut server_w, &json!({ "id": frame["id"], "result": result })).await;
        }
    });

    (dispatcher, log)
}

async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(writer: &mut W, message: &Value) {
    let mut bytes = serde_json::to_vec(message).unwrap();
    bytes.push(0);
    let _ = writer.write_all(&bytes).await;
}
