/// RC4 stream cipher keyed once and advanced with every [Rc4::process] call.
///
/// NTLM sign/seal relies on the keystream being continuous across packets,
/// so one handle per direction lives for the whole session.
#[derive(Clone)]
pub struct Rc4 {
    state: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    pub fn new(key: &[u8]) -> Self {
        let mut state = [0u8; 256];
        for (index, item) in state.iter_mut().enumerate() {
            *item = index as u8;
        }

        let mut j: u8 = 0;
        for i in 0..256 {
            j = j
                .wrapping_add(state[i])
                .wrapping_add(key[i % key.len()]);
            state.swap(i, usize::from(j));
        }

        Self { state, i: 0, j: 0 }
    }

    pub fn process(&mut self, data: &[u8]) -> Vec<u8> {
        data.iter()
            .map(|byte| {
                self.i = self.i.wrapping_add(1);
                self.j = self.j.wrapping_add(self.state[usize::from(self.i)]);
                self.state.swap(usize::from(self.i), usize::from(self.j));

                let index = self.state[usize::from(self.i)].wrapping_add(self.state[usize::from(self.j)]);

                byte ^ self.state[usize::from(index)]
            })
            .collect()
    }
}

impl std::fmt::Debug for Rc4 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rc4").finish_non_exhaustive()
    }
}
