use std::sync::Arc;

use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::error::{Error, Result};
use crate::settings::TlsSettings;

/// Builds the client TLS configuration for a stream factory. Hostname
/// verification (and with it SNI) is on unless the settings explicitly allow
/// invalid hostnames, in which case the insecure verifier is installed.
pub fn client_config(settings: &TlsSettings) -> Result<Arc<ClientConfig>> {
	let config = if settings.invalid_hostname_allowed {
		ClientConfig::builder()
			.dangerous()
			.with_custom_certificate_verifier(insecure::verifier())
			.with_no_client_auth()
	} else {
		let mut roots = rustls::RootCertStore::empty();
		for cert in rustls_native_certs::load_native_certs().certs {
			// Unusable platform certificates are skipped, not fatal.
			let _ = roots.add(cert);
		}
		ClientConfig::builder()
			.with_root_certificates(roots)
			.with_no_client_auth()
	};
	Ok(Arc::new(config))
}

/// Runs the client handshake. The server name drives SNI and certificate
/// verification; IP addresses are accepted and simply skip SNI.
pub async fn connect(
	config: Arc<ClientConfig>,
	host: &str,
	stream: TcpStream,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
	let name = ServerName::try_from(host.to_string())
		.map_err(|_| Error::Configuration(format!("invalid TLS server name {host:?}")))?;
	let connector = TlsConnector::from(config);
	connector
		.connect(name, stream)
		.await
		.map_err(|e| Error::socket(host, format!("TLS handshake failed: {e}")))
}

pub mod insecure {
	use std::sync::Arc;

	use rustls::DigitallySignedStruct;
	use rustls::client::danger::{
		HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
	};
	use rustls::crypto::{verify_tls12_signature, verify_tls13_signature};
	use rustls::pki_types::{CertificateDer, ServerName, UnixTime};

	/// Accepts any server certificate. Signature checks still run; only
	/// identity verification is skipped.
	#[derive(Debug)]
	pub struct NoVerifier(Arc<rustls::crypto::CryptoProvider>);

	pub fn verifier() -> Arc<NoVerifier> {
		Arc::new(NoVerifier(
			rustls::crypto::CryptoProvider::get_default()
				.cloned()
				.unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider())),
		))
	}

	impl ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &CertificateDer<'_>,
			_intermediates: &[CertificateDer<'_>],
			_server_name: &ServerName<'_>,
			_ocsp_response: &[u8],
			_now: UnixTime,
		) -> Result<ServerCertVerified, rustls::Error> {
			Ok(ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			message: &[u8],
			cert: &CertificateDer<'_>,
			dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
		}

		fn verify_tls13_signature(
			&self,
			message: &[u8],
			cert: &CertificateDer<'_>,
			dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
		}

		fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
			self.0.signature_verification_algorithms.supported_schemes()
		}
	}
}
