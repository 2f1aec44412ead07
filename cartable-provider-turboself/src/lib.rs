//! Provider implementation for Turboself canteen cards.
//!
//! Turboself only knows password logins and hands out short-lived bearer
//! tokens without a renewal token, so the plugin declares the token lifetime
//! and lets the session wrapper log in again ahead of expiry.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, TimeDelta};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use cartable_core::{
    http::fetch_json,
    model::{
        Additionals, CanteenBalance, CanteenMenu, Capability, Dish, DishCategory, ProviderKind,
        keys,
    },
    plugin::{PluginContext, ProviderEntry, ProviderMeta},
    ports::{Authenticated, PortError, ServicePlugin, Session},
    session::is_unauthorized,
};

/// Production API root, overridable through `instance_url`.
pub const DEFAULT_API: &str = "https://api-rest-prod.incb.fr/api";

const API: &str = "api";
const ESTABLISHMENT: &str = "establishment";
const CURRENCY: &str = "EUR";

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    access_token: String,
    hote_id: u64,
}

#[derive(Debug, Deserialize)]
struct Host {
    etab: Establishment,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Establishment {
    id: u64,
    #[serde(default)]
    menus_enabled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountEntry {
    appli_lib: String,
    montant: i64,
    nb_repas_estime: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct MenuDay {
    date: NaiveDate,
    #[serde(default)]
    midi: Vec<MenuItem>,
    #[serde(default)]
    soir: Vec<MenuItem>,
}

#[derive(Debug, Deserialize)]
struct MenuItem {
    libelle: String,
    #[serde(rename = "type")]
    kind: String,
}

/// Plugin reading one Turboself canteen card.
pub struct TurboselfPlugin {
    client: Client,
    context: PluginContext,
}

impl TurboselfPlugin {
    /// Create a plugin bound to the given HTTP client and link.
    #[must_use]
    pub fn new(client: Client, context: PluginContext) -> Self {
        Self { client, context }
    }

    fn get(&self, session: &Session, path: &str) -> Result<RequestBuilder, PortError> {
        let base = session
            .extra(API)
            .ok_or_else(|| PortError::Internal("Turboself session without API URL".to_owned()))?;
        Ok(self
            .client
            .get(format!("{base}{path}"))
            .bearer_auth(&session.access_token))
    }
}

#[async_trait]
impl ServicePlugin for TurboselfPlugin {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Turboself
    }

    fn token_lifetime(&self) -> Option<TimeDelta> {
        Some(TimeDelta::hours(1))
    }

    async fn refresh_account(&self, additionals: &Additionals) -> Result<Authenticated, PortError> {
        let (Some(username), Some(password)) = (
            additionals.get(keys::USERNAME),
            additionals.get(keys::PASSWORD),
        ) else {
            return Err(PortError::Authentication(
                "Turboself needs a username and password".to_owned(),
            ));
        };
        let api = additionals
            .get(keys::INSTANCE_URL)
            .unwrap_or(DEFAULT_API)
            .trim_end_matches('/')
            .to_owned();

        debug!(link = %self.context.link_id, "Turboself login");
        let login: LoginResponse = fetch_json(
            self.client
                .post(format!("{api}/v1/auth/login"))
                .json(&LoginRequest { username, password }),
        )
        .await
        .map_err(|error| {
            if is_unauthorized(&error) {
                PortError::Authentication(error.to_string())
            } else {
                error
            }
        })?;

        let host: Host = fetch_json(
            self.client
                .get(format!("{api}/v1/hotes/{}", login.hote_id))
                .bearer_auth(&login.access_token),
        )
        .await?;

        let mut capabilities = vec![Capability::CanteenBalance];
        if host.etab.menus_enabled {
            capabilities.push(Capability::CanteenMenu);
        }
        capabilities.push(Capability::Refresh);

        Ok(Authenticated {
            session: Session::new(login.access_token)
                .with_user(login.hote_id.to_string())
                .with_extra(API, api)
                .with_extra(ESTABLISHMENT, host.etab.id.to_string()),
            additionals: additionals.clone(),
            capabilities,
        })
    }

    async fn canteen_balances(&self, session: &Session) -> Result<Vec<CanteenBalance>, PortError> {
        let path = format!("/v1/comptes/hotes/{}/3", session.require_user()?);
        let accounts: Vec<AccountEntry> = fetch_json(self.get(session, &path)?).await?;

        Ok(accounts
            .into_iter()
            .map(|account| CanteenBalance {
                link_id: self.context.link_id.clone(),
                label: account.appli_lib,
                amount_cents: account.montant,
                currency: CURRENCY.to_owned(),
                remaining_meals: account.nb_repas_estime,
            })
            .collect())
    }

    async fn weekly_canteen_menu(
        &self,
        session: &Session,
        date: NaiveDate,
    ) -> Result<Vec<CanteenMenu>, PortError> {
        let establishment = session.extra(ESTABLISHMENT).ok_or_else(|| {
            PortError::Internal("Turboself session without establishment".to_owned())
        })?;
        let path = format!("/v1/etablissements/{establishment}/menus");
        let days: Vec<MenuDay> = fetch_json(
            self.get(session, &path)?
                .query(&[("date", date.format("%Y-%m-%d").to_string())]),
        )
        .await?;

        Ok(days
            .into_iter()
            .map(|day| CanteenMenu {
                date: day.date,
                lunch: day.midi.into_iter().map(map_dish).collect(),
                dinner: day.soir.into_iter().map(map_dish).collect(),
            })
            .collect())
    }
}

/// Build the provider entry for Turboself.
#[must_use]
pub fn provider(client: Client) -> ProviderEntry {
    ProviderEntry {
        meta: ProviderMeta {
            kind: ProviderKind::Turboself,
            name: String::from("Turboself"),
        },
        factory: Arc::new(move |context: PluginContext| {
            Arc::new(TurboselfPlugin::new(client.clone(), context)) as Arc<dyn ServicePlugin>
        }),
    }
}

fn map_dish(item: MenuItem) -> Dish {
    let category = match item.kind.as_str() {
        "ENTREE" => DishCategory::Starter,
        "PLAT" => DishCategory::Main,
        "GARNITURE" => DishCategory::Side,
        "LAITAGE" => DishCategory::Dairy,
        "DESSERT" => DishCategory::Dessert,
        _ => DishCategory::Other(item.kind),
    };
    Dish {
        name: item.libelle,
        category,
    }
}
