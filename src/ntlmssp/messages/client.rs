use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::crypto::Rc4;
use crate::ntlmssp::messages::computations::{
    compute_message_integrity_check, compute_ntlm_v2_hash, compute_ntlm_v2_response, generate_session_key,
    get_authenticate_target_info, get_challenge_timestamp,
};
use crate::ntlmssp::messages::{check_signature, FieldDescriptor, MessageFields, MessageTypes, NTLM_SIGNATURE};
use crate::ntlmssp::{
    NegotiateFlags, Ntlmssp, CHALLENGE_SIZE, ENCRYPTED_RANDOM_SESSION_KEY_SIZE, LM_CHALLENGE_RESPONSE_SIZE,
    MESSAGE_INTEGRITY_CHECK_SIZE, MIC_OFFSET,
};
use crate::utils::string_to_utf16;
use crate::{Error, Result};

const NEGOTIATE_HEADER_SIZE: usize = 32;
const NEGOTIATE_PAYLOAD_OFFSET: usize = NEGOTIATE_HEADER_SIZE + crate::ntlmssp::NTLM_VERSION_SIZE;

const AUTHENTICATE_HEADER_SIZE: usize = 64;
const AUTHENTICATE_PAYLOAD_OFFSET: usize =
    AUTHENTICATE_HEADER_SIZE + crate::ntlmssp::NTLM_VERSION_SIZE + MESSAGE_INTEGRITY_CHECK_SIZE;

fn negotiate_flags(context: &Ntlmssp) -> NegotiateFlags {
    let mut flags = NegotiateFlags::NTLM_SSP_NEGOTIATE56
        | NegotiateFlags::NTLM_SSP_NEGOTIATE128
        | NegotiateFlags::NTLM_SSP_NEGOTIATE_KEY_EXCH
        | NegotiateFlags::NTLM_SSP_NEGOTIATE_ALWAYS_SIGN
        | NegotiateFlags::NTLM_SSP_NEGOTIATE_EXTENDED_SESSION_SECURITY
        | NegotiateFlags::NTLM_SSP_NEGOTIATE_NTLM
        | NegotiateFlags::NTLM_SSP_NEGOTIATE_REQUEST_TARGET
        | NegotiateFlags::NTLM_SSP_NEGOTIATE_UNICODE
        | NegotiateFlags::NTLM_SSP_NEGOTIATE_SIGN
        | NegotiateFlags::NTLM_SSP_NEGOTIATE_SEAL
        | NegotiateFlags::NTLM_SSP_NEGOTIATE_VERSION;

    if context.config.workstation.is_some() {
        flags |= NegotiateFlags::NTLM_SSP_NEGOTIATE_WORKSTATION_SUPPLIED;
    }

    flags
}

pub(crate) fn write_negotiate(context: &mut Ntlmssp) -> Result<Vec<u8>> {
    let flags = negotiate_flags(context);

    let mut domain = MessageFields::new();
    let mut workstation = MessageFields::with_buffer(
        context
            .config
            .workstation
            .as_deref()
            .map(|workstation| workstation.as_bytes().to_vec())
            .unwrap_or_default(),
    );
    domain.buffer_offset = NEGOTIATE_PAYLOAD_OFFSET as u32;
    workstation.buffer_offset = domain.buffer_offset + domain.buffer.len() as u32;

    let mut message = Vec::with_capacity(NEGOTIATE_PAYLOAD_OFFSET + workstation.buffer.len());

    message.extend_from_slice(NTLM_SIGNATURE); // signature 8 bytes
    message.write_u32::<LittleEndian>(MessageTypes::Negotiate as u32)?; // message type 4 bytes
    message.write_u32::<LittleEndian>(flags.bits())?; // negotiate flags 4 bytes
    domain.write_to(&mut message)?; // domain name 8 bytes
    workstation.write_to(&mut message)?; // workstation 8 bytes
    message.extend_from_slice(&context.version);
    domain.write_buffer_to(&mut message)?;
    workstation.write_buffer_to(&mut message)?;

    context.flags = flags;
    context.negotiate_message = Some(message.clone());

    Ok(message)
}

pub(crate) fn read_challenge(context: &mut Ntlmssp, input: &[u8]) -> Result<()> {
    let mut reader = Cursor::new(input);
    check_signature(&mut reader, MessageTypes::Challenge)?;

    let _target_name = FieldDescriptor::read(&mut reader)?;

    let flags = reader.read_u32::<LittleEndian>()?;
    let flags = NegotiateFlags::from_bits(flags)
        .ok_or_else(|| Error::InvalidParameter(format!("invalid CHALLENGE negotiate flags: {:#x}", flags)))?;

    if !flags.contains(NegotiateFlags::NTLM_SSP_NEGOTIATE_EXTENDED_SESSION_SECURITY) {
        return Err(Error::InvalidParameter(String::from(
            "the server did not negotiate extended session security",
        )));
    }

    let mut server_challenge = [0u8; CHALLENGE_SIZE];
    std::io::Read::read_exact(&mut reader, &mut server_challenge)?;

    // Reserved.
    reader.read_u64::<LittleEndian>()?;

    let target_info = FieldDescriptor::read(&mut reader)?.extract(input)?.to_vec();

    context.flags = flags;
    context.server_challenge = server_challenge;
    context.challenge_timestamp = get_challenge_timestamp(&target_info)?;
    context.challenge_target_info = target_info;
    context.challenge_message = Some(input.to_vec());

    Ok(())
}

pub(crate) fn write_authenticate(context: &mut Ntlmssp) -> Result<Vec<u8>> {
    let identity = context
        .identity
        .clone()
        .ok_or_else(|| Error::InvalidParameter(String::from("the client must be given credentials")))?;

    let mut client_challenge = [0u8; CHALLENGE_SIZE];
    OsRng.fill_bytes(&mut client_challenge);

    let target_info = get_authenticate_target_info(&context.challenge_target_info)?;

    let ntlm_v2_hash = compute_ntlm_v2_hash(&identity)?;
    let (nt_challenge_response, key_exchange_key) = compute_ntlm_v2_response(
        &client_challenge,
        &context.server_challenge,
        &target_info,
        &ntlm_v2_hash,
        context.challenge_timestamp,
    )?;

    // NTLMv2 with a timestamped target info: the LM response is all zeroes.
    let lm_challenge_response = vec![0u8; LM_CHALLENGE_RESPONSE_SIZE];

    let (exported_session_key, encrypted_random_session_key) =
        if context.flags.contains(NegotiateFlags::NTLM_SSP_NEGOTIATE_KEY_EXCH) {
            let exported_session_key = generate_session_key()?;
            let encrypted = Rc4::new(&key_exchange_key).process(&exported_session_key);

            (exported_session_key, encrypted)
        } else {
            (key_exchange_key, Vec::new())
        };

    let mut domain = MessageFields::with_buffer(string_to_utf16(&identity.domain));
    let mut user = MessageFields::with_buffer(string_to_utf16(&identity.username));
    let mut workstation = MessageFields::with_buffer(
        context
            .config
            .workstation
            .as_deref()
            .map(string_to_utf16)
            .unwrap_or_default(),
    );
    let mut lm = MessageFields::with_buffer(lm_challenge_response);
    let mut nt = MessageFields::with_buffer(nt_challenge_response);
    let mut session_key_field = MessageFields::with_buffer(encrypted_random_session_key);

    domain.buffer_offset = AUTHENTICATE_PAYLOAD_OFFSET as u32;
    user.buffer_offset = domain.buffer_offset + domain.buffer.len() as u32;
    workstation.buffer_offset = user.buffer_offset + user.buffer.len() as u32;
    lm.buffer_offset = workstation.buffer_offset + workstation.buffer.len() as u32;
    nt.buffer_offset = lm.buffer_offset + lm.buffer.len() as u32;
    session_key_field.buffer_offset = nt.buffer_offset + nt.buffer.len() as u32;

    let mut message = Vec::with_capacity(session_key_field.buffer_offset as usize + ENCRYPTED_RANDOM_SESSION_KEY_SIZE);

    message.extend_from_slice(NTLM_SIGNATURE);
    message.write_u32::<LittleEndian>(MessageTypes::Authenticate as u32)?;
    lm.write_to(&mut message)?;
    nt.write_to(&mut message)?;
    domain.write_to(&mut message)?;
    user.write_to(&mut message)?;
    workstation.write_to(&mut message)?;
    session_key_field.write_to(&mut message)?;
    message.write_u32::<LittleEndian>(context.flags.bits())?;
    message.extend_from_slice(&context.version);
    message.extend_from_slice(&[0u8; MESSAGE_INTEGRITY_CHECK_SIZE]); // MIC, patched below
    domain.write_buffer_to(&mut message)?;
    user.write_buffer_to(&mut message)?;
    workstation.write_buffer_to(&mut message)?;
    lm.write_buffer_to(&mut message)?;
    nt.write_buffer_to(&mut message)?;
    session_key_field.write_buffer_to(&mut message)?;

    let negotiate_message = context
        .negotiate_message
        .as_deref()
        .ok_or_else(|| Error::OutOfSequence(String::from("no NEGOTIATE message was sent")))?;
    let challenge_message = context
        .challenge_message
        .as_deref()
        .ok_or_else(|| Error::OutOfSequence(String::from("no CHALLENGE message was received")))?;

    let mic = compute_message_integrity_check(negotiate_message, challenge_message, &message, &exported_session_key)?;
    message[MIC_OFFSET..MIC_OFFSET + MESSAGE_INTEGRITY_CHECK_SIZE].copy_from_slice(&mic);

    context.session_key = Some(exported_session_key);
    context.identity = Some(identity);

    Ok(message)
}
