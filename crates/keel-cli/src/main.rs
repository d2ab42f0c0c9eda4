//! Keel certificate tool: generate keypairs and issue CA-signed certs.
//!
//! ```text
//! keel-certtool [options] gen_keypair
//! keel-certtool [options] create_cert
//! keel-certtool [options] gen_keypair create_cert   # both steps at once
//! ```

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};

use keel_crypto::armor::{armor, dearmor, CERT_PEM_LABEL, PRIVATE_KEY_PEM_LABEL};
use keel_crypto::cert::ca_signed_cert;
use keel_crypto::keys::{calculate_public_key_id, openssh_decode, SigningKeypair};
use keel_proto::{encode_msg, CertKeyType, Certificate};

const DEFAULT_EXPIRY_DAYS: i64 = 730;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CommandName {
    /// Generate a new Ed25519 keypair
    #[value(name = "gen_keypair")]
    GenKeypair,
    /// Create a CA-signed cert for the selected public key
    #[value(name = "create_cert")]
    CreateCert,
}

#[derive(Parser, Debug)]
#[command(name = "keel-certtool")]
#[command(about = "Generate keypairs and certs for Keel endpoints")]
struct Args {
    /// Load the CA master private key from a PEM-like file
    #[arg(long = "ca-priv-key-file")]
    ca_priv_key_file: Option<PathBuf>,

    /// Use a specific public key (authorized_keys blob)
    #[arg(long = "pub-key")]
    pub_key: Option<String>,

    /// Load the public key from a file (authorized_keys)
    #[arg(long = "pub-key-file")]
    pub_key_file: Option<PathBuf>,

    /// Restrict to POP(s); 3- or 4-character code(s)
    #[arg(long = "pop", value_delimiter = ',')]
    pop: Vec<String>,

    /// Restrict to AppID(s)
    #[arg(long = "app", value_delimiter = ',')]
    app: Vec<u32>,

    /// Cert will expire in N days
    #[arg(long = "expiry", default_value_t = DEFAULT_EXPIRY_DAYS)]
    expiry: i64,

    /// Output JSON instead of text
    #[arg(long = "output-json")]
    output_json: bool,

    /// Commands to run, in order
    #[arg(value_enum, required = true)]
    commands: Vec<CommandName>,
}

struct Tool {
    args: Args,
    ca_key: Option<SigningKeypair>,
    cert_pub: Option<[u8; 32]>,
    pop_ids: Vec<u32>,
    json: serde_json::Map<String, serde_json::Value>,
}

impl Tool {
    fn printf(&self, text: &str) {
        if !self.args.output_json {
            println!("{text}");
        }
    }

    fn json_set(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.json.insert(key.to_string(), value.into());
    }

    fn gen_keypair(&mut self) -> Result<()> {
        self.printf("Generating keypair...");
        let keypair = SigningKeypair::generate();
        self.cert_pub = Some(keypair.public_key_bytes());

        let key_id = keypair.public_key_id();

        // Key comment: apps, POPs, then the key id.
        let mut comment = String::new();
        for app in &self.args.app {
            comment.push_str(&format!("{app}-"));
        }
        for pop in &self.args.pop {
            comment.push_str(&format!("{pop}-"));
        }
        comment.push_str(&format!("ID{key_id}"));

        let public_line = keypair.public_key_openssh(&comment);
        self.printf("\nPublic key:");
        self.printf(&public_line);
        self.json_set("public_key", public_line.clone());
        self.json_set("key_id", key_id.to_string());

        // Round-trip sanity check.
        let decoded = openssh_decode(&public_line).context("generated key failed to parse")?;
        if decoded != keypair.public_key_bytes() {
            bail!("public key round trip mismatch");
        }

        let private_pem = armor(PRIVATE_KEY_PEM_LABEL, &keypair.private_key_bytes());
        self.printf("\nPrivate key:");
        self.printf(&private_pem);
        self.json_set("private_key", private_pem);

        Ok(())
    }

    fn create_cert(&mut self) -> Result<()> {
        let Some(ca) = &self.ca_key else {
            bail!("CA private key not specified");
        };
        let Some(subject_pub) = self.cert_pub else {
            bail!("Public key not specified");
        };
        if self.args.expiry <= 0 {
            bail!("Invalid expiry '{}'", self.args.expiry);
        }

        let time_created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("system clock before epoch")?
            .as_secs() as u32;
        let time_expiry = time_created + (self.args.expiry as u32) * 24 * 3600;

        if self.args.app.len() > 1 {
            eprintln!(
                "Warning: a cert binds a single AppID; using {}",
                self.args.app[0]
            );
        }

        let cert = Certificate {
            key_type: CertKeyType::Ed25519 as i32,
            key_data: subject_pub.to_vec(),
            legacy_steam_id: None,
            identity: None,
            gameserver_datacenter_ids: self.pop_ids.clone(),
            time_created: Some(time_created),
            time_expiry: Some(time_expiry),
            app_id: self.args.app.first().copied(),
        };
        let signed = ca_signed_cert(ca, &cert);
        let signed_bytes = encode_msg(&signed);

        let pem = armor(CERT_PEM_LABEL, &signed_bytes);
        self.printf("Cert:");
        self.printf(pem.trim_end());
        self.json_set("cert", pem.replace('\n', " ").trim().to_string());

        let subject_key_id = calculate_public_key_id(&subject_pub);
        let ca_key_id = signed.ca_key_id.unwrap_or(0);

        self.printf(&format!("Public key ID. . : {subject_key_id}"));
        self.printf(&format!("Created. . . . . : {time_created}"));
        self.printf(&format!("Expires. . . . . : {time_expiry}"));
        self.printf(&format!("CA key ID. . . . : {ca_key_id}"));
        if !self.args.app.is_empty() {
            let apps: Vec<String> = self.args.app.iter().map(|a| a.to_string()).collect();
            self.printf(&format!("App ID(s). . . . : {}", apps.join(" ")));
        }
        if !self.args.pop.is_empty() {
            self.printf(&format!("POP ID(s). . . . : {}", self.args.pop.join(" ")));
        }

        self.json_set("time_created", time_created);
        self.json_set("time_expiry", time_expiry);
        self.json_set("ca_key_id", ca_key_id.to_string());
        if !self.args.app.is_empty() {
            self.json_set("app_ids", self.args.app.clone());
        }
        if !self.args.pop.is_empty() {
            self.json_set("pop_ids", self.args.pop.clone());
        }

        Ok(())
    }
}

/// Pack a 3- or 4-character POP code into its numeric id.
fn pop_id_from_code(code: &str) -> Result<u32> {
    let bytes = code.as_bytes();
    if !(3..=4).contains(&bytes.len()) || !bytes.iter().all(|b| b.is_ascii_alphanumeric()) {
        bail!("'{code}' isn't a valid POP code");
    }
    let mut id = (bytes[0] as u32) << 16 | (bytes[1] as u32) << 8 | bytes[2] as u32;
    if bytes.len() == 4 {
        id |= (bytes[3] as u32) << 24;
    }
    Ok(id)
}

fn load_ca_private_key(path: &PathBuf) -> Result<SigningKeypair> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("can't open file '{}'", path.display()))?;
    let bytes = dearmor(PRIVATE_KEY_PEM_LABEL, &text).with_context(|| {
        format!(
            "file '{}' doesn't contain a valid private Ed25519 keyfile",
            path.display()
        )
    })?;
    let seed: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("private key must be 32 bytes"))?;
    Ok(SigningKeypair::from_bytes(&seed))
}

fn main() -> Result<()> {
    keel_common::init_tracing();
    let args = Args::parse();

    let mut tool = Tool {
        ca_key: None,
        cert_pub: None,
        pop_ids: Vec::new(),
        json: serde_json::Map::new(),
        args,
    };

    for pop in &tool.args.pop {
        let id = pop_id_from_code(pop)?;
        tool.pop_ids.push(id);
    }

    if let Some(path) = tool.args.ca_priv_key_file.clone() {
        tool.ca_key = Some(load_ca_private_key(&path)?);
    }

    if let Some(line) = tool.args.pub_key.clone() {
        let key = openssh_decode(&line)
            .map_err(|e| anyhow::anyhow!("'{line}' isn't a valid public Ed25519 key: {e}"))?;
        tool.cert_pub = Some(key);
        tool.json_set("key_id", calculate_public_key_id(&key).to_string());
    }
    if let Some(path) = tool.args.pub_key_file.clone() {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("can't open file '{}'", path.display()))?;
        let key = openssh_decode(text.trim()).map_err(|e| {
            anyhow::anyhow!(
                "file '{}' doesn't contain a valid public Ed25519 key: {e}",
                path.display()
            )
        })?;
        tool.cert_pub = Some(key);
        tool.json_set("key_id", calculate_public_key_id(&key).to_string());
    }

    for command in tool.args.commands.clone() {
        match command {
            CommandName::GenKeypair => tool.gen_keypair()?,
            CommandName::CreateCert => tool.create_cert()?,
        }
    }

    if tool.args.output_json {
        println!("{}", serde_json::Value::Object(tool.json));
    }

    Ok(())
}
