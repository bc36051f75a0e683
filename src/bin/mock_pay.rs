//! mock-pay: demo wallet that sends mock payments to a running soundbox.
//!
//! Talks to the soundbox HTTP API. The selected wallet user is remembered in
//! ~/.local/share/soundbox/wallet.json between runs.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const DEFAULT_API: &str = "http://127.0.0.1:3000";

struct WalletUser {
    id: &'static str,
    name: &'static str,
    balance: f64,
}

const WALLET_USERS: &[WalletUser] = &[
    WalletUser {
        id: "user-1",
        name: "Juan dela Cruz",
        balance: 353.01,
    },
    WalletUser {
        id: "user-2",
        name: "Maria Santos",
        balance: 1250.0,
    },
    WalletUser {
        id: "user-3",
        name: "Pedro Reyes",
        balance: 500.0,
    },
];

#[derive(Parser, Debug)]
#[command(name = "mock-pay", about = "Send mock payments to a soundbox")]
struct Args {
    /// Soundbox API base URL
    #[arg(long, default_value = DEFAULT_API)]
    api: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List merchants
    Merchants,
    /// List wallet users
    Users,
    /// Switch the wallet user payments are sent as
    Use { user_id: String },
    /// Pay a merchant (id or payment link)
    Pay {
        merchant: String,
        amount: String,
        /// Customer name shown to the merchant (defaults to the wallet user)
        #[arg(long)]
        customer: Option<String>,
    },
}

// --- API types ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MerchantInfo {
    id: String,
    name: String,
}

#[derive(Deserialize)]
struct MerchantList {
    merchants: Vec<MerchantInfo>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PaymentRequest<'a> {
    merchant_id: &'a str,
    amount: &'a str,
    customer_name: &'a str,
}

// --- Stored wallet selection ---

#[derive(Serialize, Deserialize, Default)]
struct WalletState {
    user_id: Option<String>,
}

fn state_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("soundbox")
        .join("wallet.json")
}

fn current_user() -> &'static WalletUser {
    let stored = fs::read_to_string(state_path())
        .ok()
        .and_then(|s| serde_json::from_str::<WalletState>(&s).ok())
        .and_then(|s| s.user_id);
    stored
        .and_then(|id| WALLET_USERS.iter().find(|u| u.id == id))
        .unwrap_or(&WALLET_USERS[0])
}

fn save_user(user: &WalletUser) -> Result<(), String> {
    let path = state_path();
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| format!("Failed to create {}: {e}", dir.display()))?;
    }
    let json = serde_json::to_string(&WalletState {
        user_id: Some(user.id.to_string()),
    })
    .map_err(|e| e.to_string())?;
    fs::write(&path, json).map_err(|e| format!("Failed to write {}: {e}", path.display()))
}

/// Accept either a bare merchant id or a `.../pay/<id>` link.
fn merchant_id_from(arg: &str) -> &str {
    match arg.rsplit_once("/pay/") {
        Some((_, id)) => id.trim_end_matches('/'),
        None => arg,
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    let client = Client::builder()
        .connect_timeout(Duration::from_millis(500))
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap_or_else(|_| Client::new());

    let result = match &args.command {
        Command::Merchants => list_merchants(&client, &args.api).await,
        Command::Users => {
            list_users();
            Ok(())
        }
        Command::Use { user_id } => use_user(user_id),
        Command::Pay {
            merchant,
            amount,
            customer,
        } => pay(&client, &args.api, merchant_id_from(merchant), amount, customer.as_deref()).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn list_merchants(client: &Client, api: &str) -> Result<(), String> {
    let resp = client
        .get(format!("{api}/api/merchants/list"))
        .send()
        .await
        .map_err(|e| format!("Soundbox unreachable: {e}"))?;
    let list: MerchantList = resp
        .json()
        .await
        .map_err(|e| format!("Unexpected response: {e}"))?;

    for merchant in list.merchants {
        println!("{}  {}  {api}/pay/{}", merchant.id, merchant.name, merchant.id);
    }
    Ok(())
}

fn list_users() {
    let current = current_user();
    for user in WALLET_USERS {
        let marker = if user.id == current.id { "*" } else { " " };
        println!("{marker} {}  {}  ₱{:.2}", user.id, user.name, user.balance);
    }
}

fn use_user(user_id: &str) -> Result<(), String> {
    let user = WALLET_USERS
        .iter()
        .find(|u| u.id == user_id)
        .ok_or_else(|| format!("Unknown wallet user: {user_id}"))?;
    save_user(user)?;
    println!("Paying as {}", user.name);
    Ok(())
}

async fn pay(
    client: &Client,
    api: &str,
    merchant_id: &str,
    amount: &str,
    customer: Option<&str>,
) -> Result<(), String> {
    let customer_name = customer.unwrap_or(current_user().name);

    let resp = client
        .post(format!("{api}/api/payment"))
        .json(&PaymentRequest {
            merchant_id,
            amount,
            customer_name,
        })
        .send()
        .await
        .map_err(|e| format!("Soundbox unreachable: {e}"))?;

    let status = resp.status();
    let body: Value = resp
        .json()
        .await
        .map_err(|e| format!("Unexpected response: {e}"))?;

    if !status.is_success() {
        let message = body["error"].as_str().unwrap_or("Payment failed");
        return Err(format!("{message} ({status})"));
    }

    let txn = &body["transaction"];
    println!(
        "Paid ₱{:.2} to {merchant_id} as {customer_name} ({})",
        txn["amount"].as_f64().unwrap_or_default(),
        txn["id"].as_str().unwrap_or("?")
    );
    Ok(())
}
