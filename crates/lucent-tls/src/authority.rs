use std::collections::HashSet;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::{fs, io};

use lru::LruCache;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;

use crate::{CaConfig, CaError};

pub const LEAF_CACHE_CAPACITY: usize = 100;

const CA_CERT_FILE: &str = "lucent-ca-cert.pem";
const CA_KEY_FILE: &str = "lucent-ca-key.pem";

/// A leaf certificate minted for one common name, signed by the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedLeaf {
    pub common_name: String,
    pub cert_der: CertificateDer<'static>,
    pub cert_pem: String,
    pub key_pkcs8_der: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaMetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub leaves_issued: u64,
}

struct CaMaterial {
    issuer: Issuer<'static, KeyPair>,
    cert_der: CertificateDer<'static>,
    cert_pem: String,
    key_pem: String,
}

struct LeafState {
    cache: LruCache<String, Arc<IssuedLeaf>>,
    in_flight: HashSet<String>,
}

/// Root key + certificate plus the bounded leaf cache. The root material is
/// immutable after construction; leaves are minted on demand and coalesced so
/// concurrent requests for one common name share a single issuance.
pub struct CertificateAuthority {
    material: CaMaterial,
    state: Mutex<LeafState>,
    issued: Condvar,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    leaves_issued: AtomicU64,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority").finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    pub fn new(config: CaConfig) -> Result<Self, CaError> {
        config.validate()?;
        let material = load_or_generate_material(&config)?;
        let capacity = NonZeroUsize::new(LEAF_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            material,
            state: Mutex::new(LeafState {
                cache: LruCache::new(capacity),
                in_flight: HashSet::new(),
            }),
            issued: Condvar::new(),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            leaves_issued: AtomicU64::new(0),
        })
    }

    /// Returns the cached leaf for `common_name` or mints one. Waiters for a
    /// common name whose issuance is already in flight block until the
    /// designated caller finishes and then observe the same leaf.
    pub fn get_cert(&self, common_name: &str) -> Result<Arc<IssuedLeaf>, CaError> {
        let cache_key = normalize_common_name(common_name);

        let mut state = self.state.lock().map_err(|_| CaError::LockPoisoned)?;
        loop {
            if let Some(leaf) = state.cache.get(&cache_key) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::clone(leaf));
            }
            if state.in_flight.insert(cache_key.clone()) {
                break;
            }
            state = self.issued.wait(state).map_err(|_| CaError::LockPoisoned)?;
        }
        drop(state);

        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        let minted = mint_leaf(&self.material, common_name);

        let mut state = self.state.lock().map_err(|_| CaError::LockPoisoned)?;
        state.in_flight.remove(&cache_key);
        let result = match minted {
            Ok(leaf) => {
                self.leaves_issued.fetch_add(1, Ordering::Relaxed);
                let leaf = Arc::new(leaf);
                state.cache.put(cache_key, Arc::clone(&leaf));
                Ok(leaf)
            }
            Err(error) => Err(error),
        };
        drop(state);
        self.issued.notify_all();
        result
    }

    /// Builds a server config presenting `leaf` chained to the root, with the
    /// given ALPN offer.
    pub fn server_config(
        &self,
        leaf: &IssuedLeaf,
        alpn_protocols: Vec<Vec<u8>>,
    ) -> Result<Arc<ServerConfig>, CaError> {
        let chain = vec![leaf.cert_der.clone(), self.material.cert_der.clone()];
        let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(leaf.key_pkcs8_der.clone()));
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)?;
        config.alpn_protocols = alpn_protocols;
        config.send_tls13_tickets = 0;
        Ok(Arc::new(config))
    }

    pub fn root_ca_pem(&self) -> &str {
        &self.material.cert_pem
    }

    pub fn root_certificate_der(&self) -> &CertificateDer<'static> {
        &self.material.cert_der
    }

    pub fn metrics(&self) -> CaMetricsSnapshot {
        CaMetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            leaves_issued: self.leaves_issued.load(Ordering::Relaxed),
        }
    }
}

fn load_or_generate_material(config: &CaConfig) -> Result<CaMaterial, CaError> {
    let Some(directory) = &config.root_path else {
        return generate_material(config);
    };

    let cert_path = directory.join(CA_CERT_FILE);
    let key_path = directory.join(CA_KEY_FILE);
    match (cert_path.exists(), key_path.exists()) {
        (true, true) => load_material(&cert_path, &key_path),
        (false, false) => {
            let material = generate_material(config)?;
            persist_material(directory, &cert_path, &key_path, &material)?;
            Ok(material)
        }
        _ => Err(CaError::InvalidMaterial(
            "root certificate and key files must both exist or both be absent".to_string(),
        )),
    }
}

fn generate_material(config: &CaConfig) -> Result<CaMaterial, CaError> {
    let root_key = KeyPair::generate()?;
    let key_pem = root_key.serialize_pem();
    let params = build_root_params(config);
    let root_cert = params.clone().self_signed(&root_key)?;
    let cert_pem = root_cert.pem();
    let cert_der = root_cert.der().clone();
    let issuer = Issuer::new(params, root_key);

    Ok(CaMaterial {
        issuer,
        cert_der,
        cert_pem,
        key_pem,
    })
}

fn load_material(cert_path: &Path, key_path: &Path) -> Result<CaMaterial, CaError> {
    let cert_pem = fs::read_to_string(cert_path)?;
    let key_pem = fs::read_to_string(key_path)?;
    let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes()).map_err(|error| {
        CaError::InvalidMaterial(format!(
            "failed to parse root certificate PEM from {}: {error}",
            cert_path.display()
        ))
    })?;
    let root_key = KeyPair::from_pem(&key_pem)?;
    let issuer = Issuer::from_ca_cert_der(&cert_der, root_key).map_err(|error| {
        CaError::InvalidMaterial(format!(
            "failed to parse issuer metadata from root certificate {}: {error}",
            cert_path.display()
        ))
    })?;

    Ok(CaMaterial {
        issuer,
        cert_der,
        cert_pem,
        key_pem,
    })
}

fn persist_material(
    directory: &Path,
    cert_path: &Path,
    key_path: &Path,
    material: &CaMaterial,
) -> Result<(), CaError> {
    fs::create_dir_all(directory)?;
    fs::write(cert_path, material.cert_pem.as_bytes())?;
    fs::write(key_path, material.key_pem.as_bytes())?;
    restrict_key_permissions(key_path)?;
    Ok(())
}

#[cfg(unix)]
fn restrict_key_permissions(key_path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(key_path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_key_permissions(_key_path: &Path) -> io::Result<()> {
    Ok(())
}

fn build_root_params(config: &CaConfig) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, config.common_name.clone());
    distinguished_name.push(DnType::OrganizationName, config.organization.clone());
    params.distinguished_name = distinguished_name;
    params
}

fn mint_leaf(material: &CaMaterial, common_name: &str) -> Result<IssuedLeaf, CaError> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.is_ca = IsCa::NoCa;
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, common_name.to_string());
    params.distinguished_name = distinguished_name;

    if let Ok(ip) = common_name.parse::<IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else {
        params
            .subject_alt_names
            .push(SanType::DnsName(common_name.try_into()?));
    }

    let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
    let leaf_cert = params.signed_by(&leaf_key, &material.issuer)?;

    Ok(IssuedLeaf {
        common_name: common_name.to_string(),
        cert_der: leaf_cert.der().clone(),
        cert_pem: leaf_cert.pem(),
        key_pkcs8_der: leaf_key.serialize_der(),
    })
}

fn normalize_common_name(common_name: &str) -> String {
    match common_name.parse::<IpAddr>() {
        Ok(_) => common_name.to_string(),
        Err(_) => common_name.to_ascii_lowercase(),
    }
}
