//! Two-party MuSig2 rounds against the coordinator.

use bitcoin::secp256k1::{Keypair, Message, PublicKey, Secp256k1, XOnlyPublicKey, schnorr};
use musig2::{AggNonce, KeyAggContext, PartialSignature, PubNonce, SecNonce, SecNonceBuilder};
use rand::RngCore as _;

use crate::error::{Error, Result};

pub fn parse_pub_nonce(hex_nonce: &str) -> Result<PubNonce> {
    PubNonce::from_hex(hex_nonce).map_err(|e| Error::Musig(format!("nonce: {e}")))
}

pub fn parse_partial_signature(hex_sig: &str) -> Result<PartialSignature> {
    PartialSignature::from_hex(hex_sig)
        .map_err(|e| Error::Musig(format!("partial signature: {e:?}")))
}

pub fn nonce_hex(nonce: &PubNonce) -> String {
    hex::encode(nonce.serialize())
}

pub fn partial_signature_hex(sig: &PartialSignature) -> String {
    hex::encode(sig.serialize())
}

/// Aggregates `[coordinator, ours]` in that order and tweaks the result
/// with the script tree's merkle root.
pub fn aggregate_keys(
    coordinator_key: PublicKey,
    our_key: PublicKey,
    merkle_root: Option<[u8; 32]>,
) -> Result<KeyAggContext> {
    let ctx = KeyAggContext::new([coordinator_key, our_key])
        .map_err(|e| Error::Musig(format!("aggregate keys: {e}")))?;
    match merkle_root {
        Some(root) => ctx
            .with_taproot_tweak(&root)
            .map_err(|e| Error::Musig(format!("tweak aggregate key: {e}"))),
        None => Ok(ctx),
    }
}

pub fn aggregated_xonly(ctx: &KeyAggContext) -> XOnlyPublicKey {
    ctx.aggregated_pubkey()
}

/// Our half of a signing session over one message.
pub struct SigningRound {
    digest: [u8; 32],
    sec_nonce: SecNonce,
    pub pub_nonce: PubNonce,
}

impl SigningRound {
    /// Draws a fresh secret nonce; every signing attempt starts a new round.
    pub fn start(ctx: &KeyAggContext, keypair: &Keypair, msg: Message) -> Result<Self> {
        let digest: [u8; 32] = *msg.as_ref();
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);

        let sec_nonce = SecNonceBuilder::from_seckey(seed, keypair.secret_key())
            .with_message(&digest)
            .with_aggregated_pubkey(ctx.aggregated_pubkey::<musig2::secp::Point>())
            .build();
        let pub_nonce = sec_nonce.public_nonce();
        Ok(Self {
            digest,
            sec_nonce,
            pub_nonce,
        })
    }

    pub fn pub_nonce_hex(&self) -> String {
        nonce_hex(&self.pub_nonce)
    }

    fn agg_nonce(&self, their_nonce: &PubNonce) -> AggNonce {
        AggNonce::sum([their_nonce.clone(), self.pub_nonce.clone()])
    }

    /// Produces our partial signature. Consumes the round so a secret nonce
    /// is never used twice.
    pub fn sign(
        self,
        ctx: &KeyAggContext,
        keypair: &Keypair,
        their_nonce: PubNonce,
    ) -> Result<PartialSignature> {
        let agg_nonce = self.agg_nonce(&their_nonce);
        musig2::sign_partial(
            ctx,
            keypair.secret_key(),
            self.sec_nonce,
            &agg_nonce,
            self.digest,
        )
        .map_err(|e| Error::Musig(format!("partial sign: {e}")))
    }

    /// Signs, checks the counterparty's partial signature and aggregates
    /// both into a Schnorr signature under the tweaked aggregate key.
    pub fn sign_and_aggregate(
        self,
        ctx: &KeyAggContext,
        keypair: &Keypair,
        their_key: PublicKey,
        their_nonce: PubNonce,
        their_partial: PartialSignature,
    ) -> Result<schnorr::Signature> {
        let agg_nonce = self.agg_nonce(&their_nonce);
        let digest = self.digest;
        musig2::verify_partial(
            ctx,
            their_partial,
            &agg_nonce,
            their_key,
            &their_nonce,
            digest,
        )
        .map_err(|e| Error::Musig(format!("counterparty partial signature: {e}")))?;

        let ours: PartialSignature = musig2::sign_partial(
            ctx,
            keypair.secret_key(),
            self.sec_nonce,
            &agg_nonce,
            digest,
        )
        .map_err(|e| Error::Musig(format!("partial sign: {e}")))?;
        let signature: schnorr::Signature =
            musig2::aggregate_partial_signatures(ctx, &agg_nonce, [their_partial, ours], digest)
                .map_err(|e| Error::Musig(format!("aggregate signature: {e}")))?;

        Secp256k1::verification_only()
            .verify_schnorr(&signature, &Message::from_digest(digest), &aggregated_xonly(ctx))
            .map_err(|e| Error::Musig(format!("aggregate signature: {e}")))?;
        Ok(signature)
    }
}
