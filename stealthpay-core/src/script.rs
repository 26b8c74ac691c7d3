//! Output scripts produced by the send pipeline
//!
//! Besides ordinary payment scripts, two kinds of zero-value data outputs are
//! created:
//!
//! - stealth data carrier: `OP_RETURN <ephemeral_pubkey> [OP_RETURN <ciphertext>]`
//! - plain narration: `OP_RETURN "np"` followed by a second output
//!   `OP_RETURN <narration>`

use bitcoin::blockdata::opcodes::all::OP_RETURN;
use bitcoin::blockdata::script::{Builder, Instruction, PushBytesBuf};
use bitcoin::secp256k1::PublicKey;
use bitcoin::{Script, ScriptBuf};
use thiserror::Error;

use stealthpay_common::types::NARRATION_TAG;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("Push of {0} bytes is too large")]
    PushTooLarge(usize),
}

fn push_bytes(data: &[u8]) -> Result<PushBytesBuf, ScriptError> {
    PushBytesBuf::try_from(data.to_vec()).map_err(|_| ScriptError::PushTooLarge(data.len()))
}

/// Data carrier that follows a stealth payment
pub fn stealth_data_script(
    ephemeral_pubkey: &PublicKey,
    ciphertext: Option<&[u8]>,
) -> Result<ScriptBuf, ScriptError> {
    let mut builder = Builder::new()
        .push_opcode(OP_RETURN)
        .push_slice(push_bytes(&ephemeral_pubkey.serialize())?);

    if let Some(ciphertext) = ciphertext.filter(|c| !c.is_empty()) {
        builder = builder
            .push_opcode(OP_RETURN)
            .push_slice(push_bytes(ciphertext)?);
    }
    Ok(builder.into_script())
}

/// First plain narration output, carrying the `"np"` descriptor tag
pub fn narration_tag_script() -> ScriptBuf {
    let mut bytes = vec![OP_RETURN.to_u8(), NARRATION_TAG.len() as u8];
    bytes.extend_from_slice(&NARRATION_TAG);
    ScriptBuf::from_bytes(bytes)
}

/// Second plain narration output, carrying the raw narration
pub fn narration_script(narration: &str) -> Result<ScriptBuf, ScriptError> {
    Ok(Builder::new()
        .push_opcode(OP_RETURN)
        .push_slice(push_bytes(narration.as_bytes())?)
        .into_script())
}

/// Contents of a stealth data carrier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StealthData {
    pub ephemeral_pubkey: PublicKey,
    pub ciphertext: Option<Vec<u8>>,
}

/// Split a script of the form `OP_RETURN <push> [OP_RETURN <push>]...` into its pushes
fn op_return_pushes(script: &Script) -> Option<Vec<Vec<u8>>> {
    let mut pushes = Vec::new();
    let mut expect_op_return = true;

    for instruction in script.instructions() {
        match (instruction.ok()?, expect_op_return) {
            (Instruction::Op(op), true) if op == OP_RETURN => expect_op_return = false,
            (Instruction::PushBytes(data), false) => {
                pushes.push(data.as_bytes().to_vec());
                expect_op_return = true;
            }
            _ => return None,
        }
    }

    if pushes.is_empty() || !expect_op_return {
        return None;
    }
    Some(pushes)
}

/// Parse a stealth data carrier
pub fn parse_stealth_data(script: &Script) -> Option<StealthData> {
    let mut pushes = op_return_pushes(script)?.into_iter();
    let ephemeral_pubkey = PublicKey::from_slice(&pushes.next()?).ok()?;
    let ciphertext = pushes.next();
    if pushes.next().is_some() {
        return None;
    }
    Some(StealthData {
        ephemeral_pubkey,
        ciphertext,
    })
}

/// Whether a script is the `"np"` descriptor output
pub fn is_narration_tag(script: &Script) -> bool {
    matches!(op_return_pushes(script).as_deref(), Some([tag]) if tag.as_slice() == NARRATION_TAG)
}

/// Raw narration carried by the second plain narration output
pub fn parse_narration(script: &Script) -> Option<String> {
    match op_return_pushes(script)?.as_slice() {
        [data] => String::from_utf8(data.clone()).ok(),
        _ => None,
    }
}
