use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::crypto::Rc4;
use crate::ntlmssp::messages::av_pair::{AvPair, MsvAvFlags};
use crate::ntlmssp::messages::computations::{
    compute_message_integrity_check, compute_ntlm_v2_hash, generate_challenge, get_av_flags,
    get_challenge_target_info, now_file_time_timestamp, response_target_info, verify_ntlm_v2_response,
};
use crate::ntlmssp::messages::{check_signature, FieldDescriptor, MessageFields, MessageTypes, NTLM_SIGNATURE};
use crate::ntlmssp::{
    NegotiateFlags, Ntlmssp, ENCRYPTED_RANDOM_SESSION_KEY_SIZE, MESSAGE_INTEGRITY_CHECK_SIZE, MIC_OFFSET,
    SESSION_KEY_SIZE,
};
use crate::utils::{bytes_to_utf16_string, string_to_utf16};
use crate::{Error, Result};

const CHALLENGE_HEADER_SIZE: usize = 48;
const CHALLENGE_PAYLOAD_OFFSET: usize = CHALLENGE_HEADER_SIZE + crate::ntlmssp::NTLM_VERSION_SIZE;

/// Flags the server is willing to negotiate, intersected with whatever the
/// client offered.
const SUPPORTED_FLAGS: NegotiateFlags = NegotiateFlags::NTLM_SSP_NEGOTIATE56
    .union(NegotiateFlags::NTLM_SSP_NEGOTIATE128)
    .union(NegotiateFlags::NTLM_SSP_NEGOTIATE_KEY_EXCH)
    .union(NegotiateFlags::NTLM_SSP_NEGOTIATE_ALWAYS_SIGN)
    .union(NegotiateFlags::NTLM_SSP_NEGOTIATE_EXTENDED_SESSION_SECURITY)
    .union(NegotiateFlags::NTLM_SSP_NEGOTIATE_NTLM)
    .union(NegotiateFlags::NTLM_SSP_NEGOTIATE_REQUEST_TARGET)
    .union(NegotiateFlags::NTLM_SSP_NEGOTIATE_UNICODE)
    .union(NegotiateFlags::NTLM_SSP_NEGOTIATE_SIGN)
    .union(NegotiateFlags::NTLM_SSP_NEGOTIATE_SEAL)
    .union(NegotiateFlags::NTLM_SSP_NEGOTIATE_VERSION);

pub(crate) fn read_negotiate(context: &mut Ntlmssp, input: &[u8]) -> Result<()> {
    let mut reader = Cursor::new(input);
    check_signature(&mut reader, MessageTypes::Negotiate)?;

    let flags = reader.read_u32::<LittleEndian>()?;
    let client_flags = NegotiateFlags::from_bits(flags)
        .ok_or_else(|| Error::InvalidParameter(format!("invalid NEGOTIATE flags: {:#x}", flags)))?;

    if !client_flags.contains(NegotiateFlags::NTLM_SSP_NEGOTIATE_UNICODE) {
        return Err(Error::InvalidParameter(String::from(
            "the client did not offer unicode strings",
        )));
    }

    if !client_flags.contains(NegotiateFlags::NTLM_SSP_NEGOTIATE_EXTENDED_SESSION_SECURITY) {
        return Err(Error::InvalidParameter(String::from(
            "the client did not offer extended session security",
        )));
    }

    context.flags = (client_flags & SUPPORTED_FLAGS)
        | NegotiateFlags::NTLM_SSP_NEGOTIATE_TARGET_INFO
        | NegotiateFlags::NTLM_SSP_NEGOTIATE_TARGET_TYPE_SERVER;
    context.negotiate_message = Some(input.to_vec());

    Ok(())
}

pub(crate) fn write_challenge(context: &mut Ntlmssp) -> Result<Vec<u8>> {
    let server_challenge = generate_challenge()?;
    let timestamp = now_file_time_timestamp();
    let target_info_payload = get_challenge_target_info(timestamp)?;

    let mut target_name = MessageFields::with_buffer(
        context
            .config
            .workstation
            .as_deref()
            .map(string_to_utf16)
            .unwrap_or_default(),
    );
    let mut target_info = MessageFields::with_buffer(target_info_payload);

    target_name.buffer_offset = CHALLENGE_PAYLOAD_OFFSET as u32;
    target_info.buffer_offset = target_name.buffer_offset + target_name.buffer.len() as u32;

    let mut message = Vec::with_capacity(target_info.buffer_offset as usize + target_info.buffer.len());

    message.extend_from_slice(NTLM_SIGNATURE);
    message.write_u32::<LittleEndian>(MessageTypes::Challenge as u32)?;
    target_name.write_to(&mut message)?;
    message.write_u32::<LittleEndian>(context.flags.bits())?;
    message.extend_from_slice(&server_challenge);
    message.write_u64::<LittleEndian>(0)?; // Reserved
    target_info.write_to(&mut message)?;
    message.extend_from_slice(&context.version);
    target_name.write_buffer_to(&mut message)?;
    target_info.write_buffer_to(&mut message)?;

    context.server_challenge = server_challenge;
    context.challenge_timestamp = timestamp;
    context.challenge_target_info = target_info.buffer.clone();
    context.challenge_message = Some(message.clone());

    Ok(message)
}

pub(crate) fn read_authenticate(context: &mut Ntlmssp, input: &[u8]) -> Result<()> {
    let mut reader = Cursor::new(input);
    check_signature(&mut reader, MessageTypes::Authenticate)?;

    let lm_field = FieldDescriptor::read(&mut reader)?;
    let nt_field = FieldDescriptor::read(&mut reader)?;
    let domain_field = FieldDescriptor::read(&mut reader)?;
    let user_field = FieldDescriptor::read(&mut reader)?;
    let _workstation_field = FieldDescriptor::read(&mut reader)?;
    let session_key_field = FieldDescriptor::read(&mut reader)?;

    let flags = reader.read_u32::<LittleEndian>()?;
    let flags = NegotiateFlags::from_bits(flags)
        .ok_or_else(|| Error::InvalidParameter(format!("invalid AUTHENTICATE flags: {:#x}", flags)))?;

    let _lm_response = lm_field.extract(input)?;
    let nt_response = nt_field.extract(input)?;
    let username = bytes_to_utf16_string(user_field.extract(input)?)?;
    let domain = bytes_to_utf16_string(domain_field.extract(input)?)?;

    let identity = context
        .server_identities
        .iter()
        .find(|identity| {
            let domains_match = identity.domain.eq_ignore_ascii_case(&domain)
                || identity.domain.is_empty()
                || domain.is_empty();

            identity.username.eq_ignore_ascii_case(&username) && domains_match
        })
        .cloned()
        .ok_or_else(|| Error::LogonFailure(format!("{}\\{}", domain, username)))?;

    let ntlm_v2_hash = compute_ntlm_v2_hash(&identity)?;
    let key_exchange_key = verify_ntlm_v2_response(nt_response, &context.server_challenge, &ntlm_v2_hash)?;

    let exported_session_key: [u8; SESSION_KEY_SIZE] =
        if flags.contains(NegotiateFlags::NTLM_SSP_NEGOTIATE_KEY_EXCH) {
            let encrypted = session_key_field.extract(input)?;
            if encrypted.len() != ENCRYPTED_RANDOM_SESSION_KEY_SIZE {
                return Err(Error::InvalidParameter(String::from(
                    "EncryptedRandomSessionKey must be sixteen bytes",
                )));
            }

            Rc4::new(&key_exchange_key)
                .process(encrypted)
                .try_into()
                .expect("RC4 output length equals input length")
        } else {
            key_exchange_key
        };

    // The MIC spans all three handshake messages and proves nothing was
    // swapped in between. Its presence is announced in the target info.
    let av_pairs = AvPair::buffer_to_av_pairs(response_target_info(nt_response)?)?;
    if get_av_flags(&av_pairs).contains(MsvAvFlags::MESSAGE_INTEGRITY_CHECK) {
        if input.len() < MIC_OFFSET + MESSAGE_INTEGRITY_CHECK_SIZE {
            return Err(Error::InvalidParameter(String::from(
                "AUTHENTICATE message is too short to carry the announced MIC",
            )));
        }

        let mut without_mic = input.to_vec();
        let received_mic: [u8; MESSAGE_INTEGRITY_CHECK_SIZE] = without_mic
            [MIC_OFFSET..MIC_OFFSET + MESSAGE_INTEGRITY_CHECK_SIZE]
            .try_into()
            .expect("slice length is the MIC size");
        without_mic[MIC_OFFSET..MIC_OFFSET + MESSAGE_INTEGRITY_CHECK_SIZE].fill(0);

        let negotiate_message = context
            .negotiate_message
            .as_deref()
            .ok_or_else(|| Error::OutOfSequence(String::from("no NEGOTIATE message was received")))?;
        let challenge_message = context
            .challenge_message
            .as_deref()
            .ok_or_else(|| Error::OutOfSequence(String::from("no CHALLENGE message was sent")))?;

        let expected_mic =
            compute_message_integrity_check(negotiate_message, challenge_message, &without_mic, &exported_session_key)?;

        if received_mic != expected_mic {
            return Err(Error::AccessDenied(String::from(
                "AUTHENTICATE message integrity check failed",
            )));
        }
    } else if !context.config.compat_missing_mic {
        return Err(Error::AccessDenied(String::from(
            "AUTHENTICATE message carries no message integrity check",
        )));
    }

    context.flags = flags & (SUPPORTED_FLAGS
        | NegotiateFlags::NTLM_SSP_NEGOTIATE_TARGET_INFO
        | NegotiateFlags::NTLM_SSP_NEGOTIATE_TARGET_TYPE_SERVER
        | NegotiateFlags::NTLM_SSP_NEGOTIATE_WORKSTATION_SUPPLIED);
    context.session_key = Some(exported_session_key);
    context.identity = Some(identity);

    Ok(())
}
