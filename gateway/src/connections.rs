//! Bank connection registry and key lifecycle
//!
//! A connection exclusively owns its key triple and subscriber state.
//! Every multi-step flow (handshake, upload, download, ingest) runs under
//! the connection's mutex, so concurrent callers cannot race key-state
//! transitions across store transactions.

use crate::clock::Clock;
use crate::store::{
    BankAccount, BankConnection, ConnectionProtocol, EbicsConfig, KeyExchangeState, Store,
};
use crate::{Error, Result};
use moneta_ebics::keys::KeyPair;
use moneta_ebics::{envelope, EbicsClient, EbicsTransport, HttpTransport, OrderType, Subscriber, SubscriberIds};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Builds the transport a connection talks through. Tests plug in the
/// sandbox loopback here.
pub trait TransportFactory: Send + Sync {
    fn transport_for(&self, config: &EbicsConfig) -> Result<Arc<dyn EbicsTransport>>;
}

/// reqwest-backed factory for real deployments.
pub struct HttpTransportFactory;

impl TransportFactory for HttpTransportFactory {
    fn transport_for(&self, config: &EbicsConfig) -> Result<Arc<dyn EbicsTransport>> {
        Ok(Arc::new(HttpTransport::new(&config.url)?))
    }
}

/// The gateway: connection registry, payment lifecycle, ingestion.
pub struct Gateway {
    pub(crate) store: Store,
    pub(crate) clock: Arc<dyn Clock>,
    transport_factory: Arc<dyn TransportFactory>,
    /// Per-connection serialization of multi-step flows
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    pub(crate) fetch_window_days: i64,
}

impl Gateway {
    pub fn new(clock: Arc<dyn Clock>, transport_factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            store: Store::new(),
            clock,
            transport_factory,
            locks: Mutex::new(HashMap::new()),
            fetch_window_days: 30,
        }
    }

    /// How far back the first statement fetch of a connection reaches.
    pub fn with_fetch_window(mut self, days: i64) -> Self {
        self.fetch_window_days = days;
        self
    }

    pub(crate) async fn connection_lock(&self, connection_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(connection_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Create a connection with a freshly generated key triple.
    pub async fn create_connection(
        &self,
        connection_id: &str,
        protocol: ConnectionProtocol,
    ) -> Result<()> {
        let connection = BankConnection {
            connection_id: connection_id.to_string(),
            protocol,
            auth_key: KeyPair::generate()?,
            enc_key: KeyPair::generate()?,
            sig_key: KeyPair::generate()?,
            bank_auth: None,
            bank_enc: None,
            ini_state: KeyExchangeState::NotSent,
            hia_state: KeyExchangeState::NotSent,
        };
        self.insert_connection(connection).await
    }

    pub(crate) async fn insert_connection(&self, connection: BankConnection) -> Result<()> {
        let connection_id = connection.connection_id.clone();
        self.store
            .write(|state| {
                if state.connections.contains_key(&connection_id) {
                    return Err(Error::BadRequest(format!(
                        "connection '{}' already exists",
                        connection_id
                    )));
                }
                state.connections.insert(connection_id.clone(), connection);
                Ok(())
            })
            .await?;
        info!(connection = %connection_id, "bank connection created");
        Ok(())
    }

    pub async fn delete_connection(&self, connection_id: &str) -> Result<()> {
        let lock = self.connection_lock(connection_id).await;
        let _guard = lock.lock().await;
        self.store
            .write(|state| {
                state
                    .connections
                    .remove(connection_id)
                    .map(|_| ())
                    .ok_or_else(|| Error::NotFound(format!("connection '{}'", connection_id)))
            })
            .await?;
        self.locks.lock().await.remove(connection_id);
        info!(connection = %connection_id, "bank connection deleted");
        Ok(())
    }

    /// Replace the key triple and restart the handshake state machine.
    pub async fn rotate_keys(&self, connection_id: &str) -> Result<()> {
        let lock = self.connection_lock(connection_id).await;
        let _guard = lock.lock().await;
        let (auth, enc, sig) = (KeyPair::generate()?, KeyPair::generate()?, KeyPair::generate()?);
        self.store
            .write(|state| {
                let connection = state
                    .connections
                    .get_mut(connection_id)
                    .ok_or_else(|| Error::NotFound(format!("connection '{}'", connection_id)))?;
                connection.auth_key = auth;
                connection.enc_key = enc;
                connection.sig_key = sig;
                connection.bank_auth = None;
                connection.bank_enc = None;
                connection.ini_state = KeyExchangeState::NotSent;
                connection.hia_state = KeyExchangeState::NotSent;
                Ok::<(), Error>(())
            })
            .await?;
        info!(connection = %connection_id, "keys rotated, handshake reset");
        Ok(())
    }

    pub async fn list_connection_ids(&self) -> Vec<String> {
        self.store
            .read(|state| state.connections.keys().cloned().collect())
            .await
    }

    pub async fn connection(&self, connection_id: &str) -> Result<BankConnection> {
        self.store
            .read(|state| {
                state
                    .connections
                    .get(connection_id)
                    .cloned()
                    .ok_or_else(|| Error::NotFound(format!("connection '{}'", connection_id)))
            })
            .await
    }

    /// Subscriber view plus transport for one EBICS exchange.
    pub(crate) async fn ebics_session(
        &self,
        connection_id: &str,
    ) -> Result<(Subscriber, Arc<dyn EbicsTransport>)> {
        let connection = self.connection(connection_id).await?;
        let config = match &connection.protocol {
            ConnectionProtocol::Ebics(config) => config.clone(),
            ConnectionProtocol::Loopback => {
                return Err(Error::State(
                    "loopback connections exchange no data".to_string(),
                ));
            }
        };
        let subscriber = Subscriber {
            ids: SubscriberIds {
                host_id: config.host_id.clone(),
                partner_id: config.partner_id.clone(),
                user_id: config.user_id.clone(),
                system_id: config.system_id.clone(),
            },
            auth_key: connection.auth_key.clone(),
            enc_key: connection.enc_key.clone(),
            sig_key: connection.sig_key.clone(),
            bank_auth: connection.bank_auth.clone(),
            bank_enc: connection.bank_enc.clone(),
        };
        let transport = self.transport_factory.transport_for(&config)?;
        Ok((subscriber, transport))
    }

    /// HEV probe; surfaces bank capability, changes nothing.
    pub async fn probe_versions(&self, connection_id: &str) -> Result<Vec<(String, String)>> {
        let (subscriber, transport) = self.ebics_session(connection_id).await?;
        let client = EbicsClient::new(transport.as_ref(), &subscriber);
        Ok(client.probe_versions().await?)
    }

    pub async fn send_ini(&self, connection_id: &str) -> Result<()> {
        let lock = self.connection_lock(connection_id).await;
        let _guard = lock.lock().await;
        self.send_ini_locked(connection_id).await
    }

    pub(crate) async fn send_ini_locked(&self, connection_id: &str) -> Result<()> {
        let (subscriber, transport) = self.ebics_session(connection_id).await?;
        let client = EbicsClient::new(transport.as_ref(), &subscriber);
        client.send_ini(self.clock.now()).await?;
        self.store
            .write(|state| {
                if let Some(connection) = state.connections.get_mut(connection_id) {
                    connection.ini_state = KeyExchangeState::Sent;
                }
            })
            .await;
        Ok(())
    }

    pub async fn send_hia(&self, connection_id: &str) -> Result<()> {
        let lock = self.connection_lock(connection_id).await;
        let _guard = lock.lock().await;
        self.send_hia_locked(connection_id).await
    }

    pub(crate) async fn send_hia_locked(&self, connection_id: &str) -> Result<()> {
        let (subscriber, transport) = self.ebics_session(connection_id).await?;
        let client = EbicsClient::new(transport.as_ref(), &subscriber);
        client.send_hia(self.clock.now()).await?;
        self.store
            .write(|state| {
                if let Some(connection) = state.connections.get_mut(connection_id) {
                    connection.hia_state = KeyExchangeState::Sent;
                }
            })
            .await;
        Ok(())
    }

    /// HPB: learn the bank keys; the connection is ready afterwards.
    pub async fn fetch_bank_keys(&self, connection_id: &str) -> Result<()> {
        let lock = self.connection_lock(connection_id).await;
        let _guard = lock.lock().await;
        self.fetch_bank_keys_locked(connection_id).await
    }

    pub(crate) async fn fetch_bank_keys_locked(&self, connection_id: &str) -> Result<()> {
        let (subscriber, transport) = self.ebics_session(connection_id).await?;
        let client = EbicsClient::new(transport.as_ref(), &subscriber);
        let (bank_auth, bank_enc) = client.fetch_bank_keys(self.clock.now()).await?;
        self.store
            .write(|state| {
                if let Some(connection) = state.connections.get_mut(connection_id) {
                    connection.bank_auth = Some(bank_auth);
                    connection.bank_enc = Some(bank_enc);
                }
            })
            .await;
        info!(connection = %connection_id, "bank keys stored, connection ready");
        Ok(())
    }

    /// Full handshake: INI and HIA where still pending, then HPB.
    pub async fn connect(&self, connection_id: &str) -> Result<()> {
        let lock = self.connection_lock(connection_id).await;
        let _guard = lock.lock().await;

        let connection = self.connection(connection_id).await?;
        if connection.ini_state != KeyExchangeState::Sent {
            self.send_ini_locked(connection_id).await?;
        }
        if connection.hia_state != KeyExchangeState::Sent {
            self.send_hia_locked(connection_id).await?;
        }
        self.fetch_bank_keys_locked(connection_id).await
    }

    /// Register an account by hand.
    pub async fn create_account(
        &self,
        connection_id: &str,
        iban: &str,
        bic: &str,
        holder: &str,
    ) -> Result<()> {
        self.connection(connection_id).await?;
        let account = BankAccount {
            connection_id: connection_id.to_string(),
            iban: iban.to_string(),
            bic: bic.to_string(),
            holder: holder.to_string(),
            highest_seen_bank_message_id: 0,
        };
        self.store
            .write(|state| {
                if state.accounts.contains_key(iban) {
                    return Err(Error::BadRequest(format!("account '{}' already exists", iban)));
                }
                state.accounts.insert(iban.to_string(), account);
                Ok(())
            })
            .await
    }

    /// Import the bank's account list (HTD) and upsert local accounts.
    pub async fn import_accounts(&self, connection_id: &str) -> Result<Vec<BankAccount>> {
        let lock = self.connection_lock(connection_id).await;
        let _guard = lock.lock().await;

        let (subscriber, transport) = self.ebics_session(connection_id).await?;
        let client = EbicsClient::new(transport.as_ref(), &subscriber);
        let documents = client
            .download_documents(OrderType::Htd, None, self.clock.now())
            .await?;
        let document = documents
            .first()
            .ok_or_else(|| Error::State("HTD returned no account information".to_string()))?;
        let reported = envelope::parse_htd_order_data(document)?;

        let imported = self
            .store
            .write(|state| {
                let mut imported = Vec::new();
                for info in reported {
                    let account = state
                        .accounts
                        .entry(info.iban.clone())
                        .or_insert_with(|| BankAccount {
                            connection_id: connection_id.to_string(),
                            iban: info.iban.clone(),
                            bic: info.bic.clone(),
                            holder: info.holder.clone(),
                            highest_seen_bank_message_id: 0,
                        });
                    account.bic = info.bic.clone();
                    account.holder = info.holder.clone();
                    imported.push(account.clone());
                }
                imported
            })
            .await;
        info!(
            connection = %connection_id,
            count = imported.len(),
            "accounts imported from HTD"
        );
        Ok(imported)
    }

    pub async fn accounts(&self, connection_id: &str) -> Vec<BankAccount> {
        self.store
            .read(|state| {
                state
                    .accounts
                    .values()
                    .filter(|account| account.connection_id == connection_id)
                    .cloned()
                    .collect()
            })
            .await
    }
}
