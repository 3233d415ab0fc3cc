/// Request dispatcher
///
/// Maps a decoded function code and payload to an operation on a
/// [`DeviceContext`] and formats the success payload, or picks the exception
/// code to send back. Stateless and synchronous; the connection server calls
/// it once per request.

use log::debug;

use crate::context::{DeviceContext, DeviceIdentification};
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{data_utils, ModbusException, ModbusFunction};
use crate::register_bank::ModbusRegisterBank;
use crate::{
    MAX_COILS_PER_REQUEST, MAX_PDU_SIZE, MAX_REGISTERS_PER_REQUEST, MAX_WRITE_COILS_PER_REQUEST,
    MAX_WRITE_REGISTERS_PER_REQUEST,
};

/// MEI type for Read Device Identification
pub const MEI_READ_DEVICE_ID: u8 = 0x0E;

/// Regular identification, stream and individual access
const CONFORMITY_LEVEL: u8 = 0x82;

const BASIC_OBJECTS: &[u8] = &[0x00, 0x01, 0x02];
const REGULAR_OBJECTS: &[u8] = &[0x00, 0x01, 0x02, 0x04, 0x05];

/// Execute one request against `device`
///
/// Returns the response payload (without the function code) or the exception
/// to report.
pub fn dispatch(
    device: &DeviceContext,
    function_code: u8,
    payload: &[u8],
) -> Result<Vec<u8>, ModbusException> {
    execute(device, function_code, payload).map_err(|e| {
        let exception = e.to_exception();
        debug!("Function 0x{:02x} rejected: {} -> {}", function_code, e, exception.name());
        exception
    })
}

fn execute(device: &DeviceContext, function_code: u8, payload: &[u8]) -> ModbusResult<Vec<u8>> {
    let registers = device.registers();

    match ModbusFunction::from_u8(function_code)? {
        ModbusFunction::ReadCoils => {
            handle_read_bits(payload, |address, quantity| registers.read_coils(address, quantity))
        }
        ModbusFunction::ReadDiscreteInputs => handle_read_bits(payload, |address, quantity| {
            registers.read_discrete_inputs(address, quantity)
        }),
        ModbusFunction::ReadHoldingRegisters => handle_read_registers(payload, |address, quantity| {
            registers.read_holding_registers(address, quantity)
        }),
        ModbusFunction::ReadInputRegisters => handle_read_registers(payload, |address, quantity| {
            registers.read_input_registers(address, quantity)
        }),
        ModbusFunction::WriteSingleCoil => handle_write_single_coil(payload, registers),
        ModbusFunction::WriteSingleRegister => handle_write_single_register(payload, registers),
        ModbusFunction::WriteMultipleCoils => handle_write_multiple_coils(payload, registers),
        ModbusFunction::WriteMultipleRegisters => handle_write_multiple_registers(payload, registers),
        ModbusFunction::ReadDeviceIdentification => {
            handle_read_device_identification(payload, device.identification())
        }
    }
}

fn parse_address_quantity(data: &[u8]) -> (u16, u16) {
    (
        u16::from_be_bytes([data[0], data[1]]),
        u16::from_be_bytes([data[2], data[3]]),
    )
}

/// Handle read coils (0x01) and read discrete inputs (0x02)
fn handle_read_bits<F>(data: &[u8], read: F) -> ModbusResult<Vec<u8>>
where
    F: FnOnce(u16, u16) -> ModbusResult<Vec<bool>>,
{
    if data.len() != 4 {
        return Err(ModbusError::invalid_data("Invalid read bits request"));
    }

    let (address, quantity) = parse_address_quantity(data);
    if quantity == 0 || quantity > MAX_COILS_PER_REQUEST {
        return Err(ModbusError::invalid_data(format!("Invalid quantity: {}", quantity)));
    }

    let bits = read(address, quantity)?;
    let packed = data_utils::pack_bits(&bits);

    let mut response = Vec::with_capacity(1 + packed.len());
    response.push(packed.len() as u8);
    response.extend_from_slice(&packed);
    Ok(response)
}

/// Handle read holding registers (0x03) and read input registers (0x04)
fn handle_read_registers<F>(data: &[u8], read: F) -> ModbusResult<Vec<u8>>
where
    F: FnOnce(u16, u16) -> ModbusResult<Vec<u16>>,
{
    if data.len() != 4 {
        return Err(ModbusError::invalid_data("Invalid read registers request"));
    }

    let (address, quantity) = parse_address_quantity(data);
    if quantity == 0 || quantity > MAX_REGISTERS_PER_REQUEST {
        return Err(ModbusError::invalid_data(format!("Invalid quantity: {}", quantity)));
    }

    let registers = read(address, quantity)?;
    let bytes = data_utils::registers_to_bytes(&registers);

    let mut response = Vec::with_capacity(1 + bytes.len());
    response.push(bytes.len() as u8);
    response.extend_from_slice(&bytes);
    Ok(response)
}

/// Handle write single coil (0x05)
fn handle_write_single_coil(data: &[u8], registers: &ModbusRegisterBank) -> ModbusResult<Vec<u8>> {
    if data.len() != 4 {
        return Err(ModbusError::invalid_data("Invalid write single coil request"));
    }

    let (address, value) = parse_address_quantity(data);
    let coil_value = match value {
        0x0000 => false,
        0xFF00 => true,
        _ => return Err(ModbusError::invalid_data(format!("Invalid coil value: 0x{:04X}", value))),
    };

    registers.write_coils(address, &[coil_value])?;

    // Echo back the request
    Ok(data.to_vec())
}

/// Handle write single register (0x06)
fn handle_write_single_register(data: &[u8], registers: &ModbusRegisterBank) -> ModbusResult<Vec<u8>> {
    if data.len() != 4 {
        return Err(ModbusError::invalid_data("Invalid write single register request"));
    }

    let (address, value) = parse_address_quantity(data);
    registers.write_holding_registers(address, &[value])?;

    // Echo back the request
    Ok(data.to_vec())
}

/// Handle write multiple coils (0x0F)
fn handle_write_multiple_coils(data: &[u8], registers: &ModbusRegisterBank) -> ModbusResult<Vec<u8>> {
    if data.len() < 5 {
        return Err(ModbusError::invalid_data("Invalid write multiple coils request"));
    }

    let (address, quantity) = parse_address_quantity(data);
    let byte_count = usize::from(data[4]);

    if quantity == 0 || quantity > MAX_WRITE_COILS_PER_REQUEST {
        return Err(ModbusError::invalid_data(format!("Invalid quantity: {}", quantity)));
    }
    if byte_count != (usize::from(quantity) + 7) / 8 || data.len() != 5 + byte_count {
        return Err(ModbusError::invalid_data("Byte count does not match coil quantity"));
    }

    let coils = data_utils::unpack_bits(&data[5..], usize::from(quantity));
    registers.write_coils(address, &coils)?;

    // Return address and quantity
    Ok(data[0..4].to_vec())
}

/// Handle write multiple registers (0x10)
fn handle_write_multiple_registers(data: &[u8], registers: &ModbusRegisterBank) -> ModbusResult<Vec<u8>> {
    if data.len() < 5 {
        return Err(ModbusError::invalid_data("Invalid write multiple registers request"));
    }

    let (address, quantity) = parse_address_quantity(data);
    let byte_count = usize::from(data[4]);

    if quantity == 0 || quantity > MAX_WRITE_REGISTERS_PER_REQUEST {
        return Err(ModbusError::invalid_data(format!("Invalid quantity: {}", quantity)));
    }
    if byte_count != usize::from(quantity) * 2 || data.len() != 5 + byte_count {
        return Err(ModbusError::invalid_data("Byte count does not match register quantity"));
    }

    let values = data_utils::bytes_to_registers(&data[5..])?;
    registers.write_holding_registers(address, &values)?;

    // Return address and quantity
    Ok(data[0..4].to_vec())
}

/// Handle read device identification (0x2B / MEI 0x0E)
fn handle_read_device_identification(
    data: &[u8],
    identification: &DeviceIdentification,
) -> ModbusResult<Vec<u8>> {
    if data.len() != 3 || data[0] != MEI_READ_DEVICE_ID {
        return Err(ModbusError::invalid_data("Invalid read device identification request"));
    }

    let read_code = data[1];
    let object_id = data[2];

    let objects: Vec<(u8, &str)> = match read_code {
        0x01 | 0x02 | 0x03 => {
            let ids = if read_code == 0x01 { BASIC_OBJECTS } else { REGULAR_OBJECTS };
            // unknown start object: restart the stream at object 0
            let start = if ids.contains(&object_id) { object_id } else { 0x00 };
            ids.iter()
                .filter(|&&id| id >= start)
                .filter_map(|&id| identification.object(id).map(|value| (id, value)))
                .collect()
        }
        0x04 => {
            let value = identification
                .object(object_id)
                .ok_or_else(|| ModbusError::invalid_address(u16::from(object_id), 1))?;
            vec![(object_id, value)]
        }
        _ => return Err(ModbusError::invalid_data(format!("Invalid read device id code: {}", read_code))),
    };

    // MEI type, read code, conformity, more follows, next object id, object count
    let mut response = vec![MEI_READ_DEVICE_ID, read_code, CONFORMITY_LEVEL, 0x00, 0x00, 0x00];
    let capacity = MAX_PDU_SIZE - 1;
    let mut count = 0u8;

    for (id, value) in objects {
        let bytes = value.as_bytes();
        let remaining = capacity - response.len();
        if 2 + bytes.len() > remaining {
            if count > 0 {
                response[3] = 0xFF;
                response[4] = id;
                break;
            }
            // a lone oversized object is truncated rather than never served
            let fitted = &bytes[..remaining - 2];
            response.extend_from_slice(&[id, fitted.len() as u8]);
            response.extend_from_slice(fitted);
            count += 1;
            break;
        }

        response.extend_from_slice(&[id, bytes.len() as u8]);
        response.extend_from_slice(bytes);
        count += 1;
    }

    response[5] = count;
    Ok(response)
}
