use boring::pkey::PKey;
use boring::ssl::{SslAcceptor, SslAcceptorBuilder, SslMethod};
use boring::x509::X509;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

/// Generate a self-signed certificate for 127.0.0.1 and localhost.
///
/// Returns the acceptor builder and the certificate PEM, which doubles as the
/// trust root since the certificate signs itself.
pub fn generate_cert_bundle() -> (SslAcceptorBuilder, Vec<u8>) {
    let subject_alt_names = vec!["127.0.0.1".to_string(), "localhost".to_string()];

    let cert =
        rcgen::generate_simple_self_signed(subject_alt_names).expect("Failed to generate cert");
    let cert_pem = cert.cert.pem();
    let key_pem = cert.signing_key.serialize_pem();

    let pkey = PKey::private_key_from_pem(key_pem.as_bytes()).expect("Failed to parse private key");
    let x509 = X509::from_pem(cert_pem.as_bytes()).expect("Failed to parse certificate");

    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())
        .expect("Failed to create SslAcceptor builder");
    builder
        .set_private_key(&pkey)
        .expect("Failed to set private key");
    builder
        .set_certificate(&x509)
        .expect("Failed to set certificate");

    (builder, cert_pem.into_bytes())
}

/// TLS server that completes handshakes and then idles each connection until
/// the client hangs up.
///
/// `alpn` is the server's preference list in wire format, e.g. `b"\x02h2"`.
#[allow(dead_code)]
pub async fn start_tls_server(alpn: &'static [u8]) -> (u16, Vec<u8>, tokio::task::JoinHandle<()>) {
    let (mut builder, ca_cert) = generate_cert_bundle();
    builder.set_alpn_select_callback(move |_, client_protos| {
        boring::ssl::select_next_proto(alpn, client_protos).ok_or(boring::ssl::AlpnError::NOACK)
    });
    let acceptor = builder.build();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Ok(mut tls) = tokio_boring::accept(&acceptor, stream).await {
                    let mut sink = Vec::new();
                    let _ = tls.read_to_end(&mut sink).await;
                }
            });
        }
    });
    (port, ca_cert, handle)
}
