use bitcoin::hashes::{Hash as _, ripemd160};
use bitcoin::opcodes::all::{OP_CHECKSIG, OP_CHECKSIGVERIFY, OP_CLTV, OP_EQUALVERIFY, OP_HASH160, OP_SIZE};
use bitcoin::opcodes::{self, Opcode};
use bitcoin::script::{Builder, Instruction, Instructions, Script, ScriptBuf};
use bitcoin::secp256k1::{PublicKey, Secp256k1, Verification};
use bitcoin::taproot::{LeafVersion, TaprootBuilder, TaprootSpendInfo};
use bitcoin::XOnlyPublicKey;
use musig2::KeyAggContext;

use crate::claim::musig::{aggregate_keys, aggregated_xonly};
use crate::error::{Error, Result};
use crate::swap::{SwapTree, TreeLeaf};

pub const TAPSCRIPT_LEAF_VERSION: u8 = 0xc0;

/// The two leaves of a swap output.
///
/// claim:  `OP_SIZE 32 OP_EQUALVERIFY OP_HASH160 <ripemd160(preimage hash)> OP_EQUALVERIFY <claim key> OP_CHECKSIG`
/// refund: `<refund key> OP_CHECKSIGVERIFY <timeout> OP_CLTV`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapScript {
    pub preimage_hash160: [u8; 20],
    pub claim_key: XOnlyPublicKey,
    pub refund_key: XOnlyPublicKey,
    pub timeout_block_height: u32,
}

impl SwapScript {
    pub fn new(
        preimage_hash: &[u8; 32],
        claim_key: XOnlyPublicKey,
        refund_key: XOnlyPublicKey,
        timeout_block_height: u32,
    ) -> Self {
        Self {
            preimage_hash160: ripemd160::Hash::hash(preimage_hash).to_byte_array(),
            claim_key,
            refund_key,
            timeout_block_height,
        }
    }

    pub fn claim_script(&self) -> ScriptBuf {
        Builder::new()
            .push_opcode(OP_SIZE)
            .push_int(32)
            .push_opcode(OP_EQUALVERIFY)
            .push_opcode(OP_HASH160)
            .push_slice(self.preimage_hash160)
            .push_opcode(OP_EQUALVERIFY)
            .push_x_only_key(&self.claim_key)
            .push_opcode(OP_CHECKSIG)
            .into_script()
    }

    pub fn refund_script(&self) -> ScriptBuf {
        Builder::new()
            .push_x_only_key(&self.refund_key)
            .push_opcode(OP_CHECKSIGVERIFY)
            .push_int(i64::from(self.timeout_block_height))
            .push_opcode(OP_CLTV)
            .into_script()
    }

    pub fn to_swap_tree(&self) -> SwapTree {
        SwapTree {
            claim_leaf: TreeLeaf {
                version: TAPSCRIPT_LEAF_VERSION,
                output: self.claim_script().to_hex_string(),
            },
            refund_leaf: TreeLeaf {
                version: TAPSCRIPT_LEAF_VERSION,
                output: self.refund_script().to_hex_string(),
            },
        }
    }

    pub fn from_swap_tree(tree: &SwapTree) -> Result<Self> {
        for leaf in [&tree.claim_leaf, &tree.refund_leaf] {
            if leaf.version != TAPSCRIPT_LEAF_VERSION {
                return Err(Error::Taproot(format!(
                    "unexpected leaf version {:#x}",
                    leaf.version
                )));
            }
        }
        let claim = ScriptBuf::from_hex(&tree.claim_leaf.output)
            .map_err(|e| Error::Taproot(format!("claim leaf hex: {e}")))?;
        let refund = ScriptBuf::from_hex(&tree.refund_leaf.output)
            .map_err(|e| Error::Taproot(format!("refund leaf hex: {e}")))?;

        let (preimage_hash160, claim_key) = parse_claim_script(&claim)?;
        let (refund_key, timeout_block_height) = parse_refund_script(&refund)?;
        Ok(Self {
            preimage_hash160,
            claim_key,
            refund_key,
            timeout_block_height,
        })
    }

    pub fn matches_preimage_hash(&self, preimage_hash: &[u8; 32]) -> bool {
        self.preimage_hash160 == ripemd160::Hash::hash(preimage_hash).to_byte_array()
    }
}

fn next_instruction<'a>(iter: &mut Instructions<'a>) -> Result<Instruction<'a>> {
    iter.next()
        .transpose()
        .map_err(|e| Error::Taproot(format!("decode script instruction: {e}")))?
        .ok_or_else(|| Error::Taproot("unexpected end of script".into()))
}

fn expect_op(actual: Instruction<'_>, expected: Opcode) -> Result<()> {
    match actual {
        Instruction::Op(op) if op == expected => Ok(()),
        other => Err(Error::Taproot(format!(
            "expected {expected:?}, got {other:?}"
        ))),
    }
}

fn expect_push<const N: usize>(actual: Instruction<'_>) -> Result<[u8; N]> {
    match actual {
        Instruction::PushBytes(bytes) if bytes.len() == N => {
            let mut out = [0u8; N];
            out.copy_from_slice(bytes.as_bytes());
            Ok(out)
        }
        other => Err(Error::Taproot(format!(
            "expected push of {N} bytes, got {other:?}"
        ))),
    }
}

fn expect_x_only(actual: Instruction<'_>) -> Result<XOnlyPublicKey> {
    let bytes = expect_push::<32>(actual)?;
    XOnlyPublicKey::from_slice(&bytes).map_err(|e| Error::Taproot(format!("x-only key: {e}")))
}

fn parse_script_num(actual: Instruction<'_>) -> Result<i64> {
    match actual {
        Instruction::PushBytes(bytes) => decode_script_num(bytes.as_bytes()),
        Instruction::Op(op) => {
            let code = op.to_u8();
            let one = opcodes::all::OP_PUSHNUM_1.to_u8();
            let sixteen = opcodes::all::OP_PUSHNUM_16.to_u8();
            if (one..=sixteen).contains(&code) {
                return Ok(i64::from(code - one + 1));
            }
            Err(Error::Taproot(format!(
                "expected script number, got {op:?}"
            )))
        }
    }
}

fn decode_script_num(bytes: &[u8]) -> Result<i64> {
    if bytes.is_empty() {
        return Ok(0);
    }
    if bytes.len() > 5 {
        return Err(Error::Taproot(format!(
            "script number too large: {} bytes",
            bytes.len()
        )));
    }

    let mut magnitude = bytes.to_vec();
    let negative = magnitude.last().is_some_and(|b| (b & 0x80) != 0);
    if let Some(last) = magnitude.last_mut() {
        *last &= 0x7f;
    }

    let mut value: i64 = 0;
    for (i, b) in magnitude.iter().enumerate() {
        value |= i64::from(*b) << (8 * i);
    }
    Ok(if negative { -value } else { value })
}

fn expect_end(iter: &mut Instructions<'_>) -> Result<()> {
    if iter.next().is_some() {
        return Err(Error::Taproot("unexpected trailing instructions".into()));
    }
    Ok(())
}

pub fn parse_claim_script(script: &Script) -> Result<([u8; 20], XOnlyPublicKey)> {
    let mut iter = script.instructions_minimal();

    expect_op(next_instruction(&mut iter)?, OP_SIZE)?;
    let size = parse_script_num(next_instruction(&mut iter)?)?;
    if size != 32 {
        return Err(Error::Taproot(format!("unexpected preimage size check: {size}")));
    }
    expect_op(next_instruction(&mut iter)?, OP_EQUALVERIFY)?;
    expect_op(next_instruction(&mut iter)?, OP_HASH160)?;
    let hash160 = expect_push::<20>(next_instruction(&mut iter)?)?;
    expect_op(next_instruction(&mut iter)?, OP_EQUALVERIFY)?;
    let claim_key = expect_x_only(next_instruction(&mut iter)?)?;
    expect_op(next_instruction(&mut iter)?, OP_CHECKSIG)?;
    expect_end(&mut iter)?;

    Ok((hash160, claim_key))
}

pub fn parse_refund_script(script: &Script) -> Result<(XOnlyPublicKey, u32)> {
    let mut iter = script.instructions_minimal();

    let refund_key = expect_x_only(next_instruction(&mut iter)?)?;
    expect_op(next_instruction(&mut iter)?, OP_CHECKSIGVERIFY)?;
    let timeout = parse_script_num(next_instruction(&mut iter)?)?;
    let timeout = u32::try_from(timeout)
        .map_err(|_| Error::Taproot(format!("refund timeout out of range: {timeout}")))?;
    expect_op(next_instruction(&mut iter)?, OP_CLTV)?;
    expect_end(&mut iter)?;

    Ok((refund_key, timeout))
}

/// A swap output: MuSig2 key path over `[coordinator, ours]` tweaked with
/// the script tree.
pub struct TaprootSwap {
    pub script: SwapScript,
    pub key_agg: KeyAggContext,
    pub spend_info: TaprootSpendInfo,
}

impl TaprootSwap {
    pub fn new<C: Verification>(
        secp: &Secp256k1<C>,
        script: SwapScript,
        coordinator_key: PublicKey,
        our_key: PublicKey,
    ) -> Result<Self> {
        let internal_key = aggregated_xonly(&aggregate_keys(coordinator_key, our_key, None)?);

        let spend_info = TaprootBuilder::new()
            .add_leaf_with_ver(1, script.claim_script(), LeafVersion::TapScript)
            .and_then(|b| b.add_leaf_with_ver(1, script.refund_script(), LeafVersion::TapScript))
            .map_err(|e| Error::Taproot(format!("build tree: {e}")))?
            .finalize(secp, internal_key)
            .map_err(|_| Error::Taproot("finalize tree".into()))?;
        let merkle_root = spend_info
            .merkle_root()
            .ok_or_else(|| Error::Taproot("tree has no merkle root".into()))?;

        let key_agg = aggregate_keys(coordinator_key, our_key, Some(merkle_root.to_byte_array()))?;
        if aggregated_xonly(&key_agg) != spend_info.output_key().to_x_only_public_key() {
            return Err(Error::Taproot(
                "tweaked aggregate key does not match output key".into(),
            ));
        }

        Ok(Self {
            script,
            key_agg,
            spend_info,
        })
    }

    pub fn from_swap_tree<C: Verification>(
        secp: &Secp256k1<C>,
        tree: &SwapTree,
        coordinator_key: PublicKey,
        our_key: PublicKey,
    ) -> Result<Self> {
        Self::new(secp, SwapScript::from_swap_tree(tree)?, coordinator_key, our_key)
    }

    pub fn output_key(&self) -> XOnlyPublicKey {
        self.spend_info.output_key().to_x_only_public_key()
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        ScriptBuf::new_p2tr_tweaked(self.spend_info.output_key())
    }
}

pub fn parse_public_key(hex_key: &str, what: &str) -> Result<PublicKey> {
    hex_key
        .parse()
        .map_err(|e| Error::InvalidResponse(format!("{what} public key: {e}")))
}

#[cfg(test)]
mod tests {
    use bitcoin::secp256k1::Keypair;

    use super::*;

    fn keypair(byte: u8) -> Keypair {
        let secp = Secp256k1::new();
        Keypair::from_seckey_slice(&secp, &[byte; 32]).unwrap()
    }

    #[test]
    fn tree_round_trips_through_hex() {
        let claim = keypair(1).x_only_public_key().0;
        let refund = keypair(2).x_only_public_key().0;
        let script = SwapScript::new(&[7; 32], claim, refund, 840_123);

        let parsed = SwapScript::from_swap_tree(&script.to_swap_tree()).unwrap();
        assert_eq!(parsed, script);
        assert!(parsed.matches_preimage_hash(&[7; 32]));
        assert!(!parsed.matches_preimage_hash(&[8; 32]));
    }

    #[test]
    fn small_timeouts_use_pushnum() {
        let claim = keypair(1).x_only_public_key().0;
        let script = SwapScript::new(&[0; 32], claim, claim, 16);
        let (_, timeout) = parse_refund_script(&script.refund_script()).unwrap();
        assert_eq!(timeout, 16);
    }

    #[test]
    fn rejects_foreign_leaf() {
        let claim = keypair(1).x_only_public_key().0;
        let script = SwapScript::new(&[0; 32], claim, claim, 100);
        let mut tree = script.to_swap_tree();
        tree.claim_leaf.output = script.refund_script().to_hex_string();
        assert!(SwapScript::from_swap_tree(&tree).is_err());

        let mut tree = script.to_swap_tree();
        tree.refund_leaf.version = 0xc2;
        assert!(SwapScript::from_swap_tree(&tree).is_err());
    }

    #[test]
    fn output_key_is_tweaked_aggregate() {
        let secp = Secp256k1::new();
        let coordinator = keypair(3);
        let ours = keypair(4);
        let script = SwapScript::new(
            &[9; 32],
            ours.x_only_public_key().0,
            coordinator.x_only_public_key().0,
            500,
        );
        let swap =
            TaprootSwap::new(&secp, script, coordinator.public_key(), ours.public_key()).unwrap();
        assert_eq!(aggregated_xonly(&swap.key_agg), swap.output_key());
        assert!(swap.script_pubkey().is_p2tr());

        let swapped_order = TaprootSwap::new(
            &secp,
            swap.script.clone(),
            ours.public_key(),
            coordinator.public_key(),
        )
        .unwrap();
        assert_ne!(swapped_order.output_key(), swap.output_key());
    }
}
