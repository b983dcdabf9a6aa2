use std::time::Duration;

use reqwest::{Client, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use url::Url;

use super::{
    ChainClaimRequest, ChainSwapTransactions, CreateChainRequest, CreateChainResponse,
    CreateReverseRequest, CreateReverseResponse, CreateSubmarineRequest, CreateSubmarineResponse,
    Market, PairTable, PartialSignature, ReverseClaimRequest, ServerClaimDetails, SwapApi,
    SwapStatusResponse, TransactionInfo,
};
use crate::error::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// REST client for the coordinator's `/v2` API.
#[derive(Debug, Clone)]
pub struct BoltzHttpClient {
    http: Client,
    base: Url,
}

#[derive(serde::Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(serde::Deserialize)]
struct BroadcastResponse {
    id: String,
}

impl BoltzHttpClient {
    pub fn new(base: &str) -> Result<Self> {
        let mut base =
            Url::parse(base).map_err(|e| Error::Config(format!("api url {base:?}: {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { http, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| Error::Config(format!("api path {path:?}: {e}")))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path)?;
        tracing::debug!(%url, "GET");
        let resp = self.http.get(url).send().await?;
        decode(path, resp).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let url = self.url(path)?;
        tracing::debug!(%url, "POST");
        let resp = self.http.post(url).json(body).send().await?;
        decode(path, resp).await
    }
}

async fn decode<T: DeserializeOwned>(path: &str, resp: Response) -> Result<T> {
    let status = resp.status();
    let text = resp.text().await?;
    if !status.is_success() {
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|b| b.error)
            .unwrap_or_else(|_| format!("{status}: {text}"));
        return Err(Error::Remote {
            endpoint: path.to_string(),
            message,
        });
    }
    serde_json::from_str(&text)
        .map_err(|e| Error::InvalidResponse(format!("{path}: {e}")))
}

impl SwapApi for BoltzHttpClient {
    async fn pairs(&self, market: Market) -> Result<PairTable> {
        let path = match market {
            Market::Submarine => "v2/swap/submarine",
            Market::Reverse => "v2/swap/reverse",
            Market::Chain => "v2/swap/chain",
        };
        self.get_json(path).await
    }

    async fn create_submarine_swap(
        &self,
        req: &CreateSubmarineRequest,
    ) -> Result<CreateSubmarineResponse> {
        self.post_json("v2/swap/submarine", req).await
    }

    async fn create_reverse_swap(&self, req: &CreateReverseRequest) -> Result<CreateReverseResponse> {
        self.post_json("v2/swap/reverse", req).await
    }

    async fn create_chain_swap(&self, req: &CreateChainRequest) -> Result<CreateChainResponse> {
        self.post_json("v2/swap/chain", req).await
    }

    async fn swap_status(&self, id: &str) -> Result<SwapStatusResponse> {
        self.get_json(&format!("v2/swap/{id}")).await
    }

    async fn reverse_transaction(&self, id: &str) -> Result<TransactionInfo> {
        self.get_json(&format!("v2/swap/reverse/{id}/transaction"))
            .await
    }

    async fn chain_transactions(&self, id: &str) -> Result<ChainSwapTransactions> {
        self.get_json(&format!("v2/swap/chain/{id}/transactions"))
            .await
    }

    async fn chain_claim_details(&self, id: &str) -> Result<ServerClaimDetails> {
        self.get_json(&format!("v2/swap/chain/{id}/claim")).await
    }

    async fn post_chain_claim(&self, id: &str, req: &ChainClaimRequest) -> Result<PartialSignature> {
        self.post_json(&format!("v2/swap/chain/{id}/claim"), req)
            .await
    }

    async fn post_reverse_claim(
        &self,
        id: &str,
        req: &ReverseClaimRequest,
    ) -> Result<PartialSignature> {
        self.post_json(&format!("v2/swap/reverse/{id}/claim"), req)
            .await
    }

    async fn broadcast(&self, currency: &str, tx_hex: &str) -> Result<String> {
        let resp: BroadcastResponse = self
            .post_json(
                &format!("v2/chain/{currency}/transaction"),
                &serde_json::json!({ "hex": tx_hex }),
            )
            .await?;
        Ok(resp.id)
    }
}
